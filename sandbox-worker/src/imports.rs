//! Static import rewriting
//!
//! Scripts run as the body of an async function, where static `import`
//! declarations are a syntax error. Declarations that start a line are
//! rewritten into `await import(...)` bindings before compiling:
//!
//! ```text
//! import fs from 'fs'                 const fs = (await import('fs')).default;
//! import * as path from 'node:path'   const path = await import('node:path');
//! import { join as j } from 'path'    const { join: j } = await import('path');
//! import 'node:fs'                    await import('node:fs');
//! ```
//!
//! Line numbers are preserved. Anything that does not parse as an import
//! declaration is left alone for the engine to report.

/// Rewrites every static import declaration in `source`
pub fn rewrite(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while !rest.is_empty() {
        let line_end = rest.find('\n').map_or(rest.len(), |i| i + 1);
        let indent = rest.len() - rest.trim_start_matches([' ', '\t']).len();

        match declaration(&rest[indent..]) {
            Some((statement, consumed)) => {
                let original = &rest[..indent + consumed];
                out.push_str(&rest[..indent]);
                out.push_str(&statement);
                // Keep the lines the declaration spanned
                out.extend(std::iter::repeat_n('\n', original.matches('\n').count()));
                rest = &rest[indent + consumed..];
            }
            None => {
                out.push_str(&rest[..line_end]);
                rest = &rest[line_end..];
            }
        }
    }
    out
}

/// Parses an import declaration at the start of `text`
///
/// Returns the replacement statement and how many bytes it replaces.
fn declaration(text: &str) -> Option<(String, usize)> {
    let after = text.strip_prefix("import")?;
    match after.chars().next()? {
        ' ' | '\t' | '\n' | '{' | '*' | '\'' | '"' => {}
        _ => return None,
    }

    let quote_at = after.find(['\'', '"'])?;
    let quote = after[quote_at..].chars().next()?;
    let specifier_len = after[quote_at + 1..].find(quote)?;
    let specifier = &after[quote_at + 1..quote_at + 1 + specifier_len];
    if specifier.contains('\n') {
        return None;
    }
    let mut consumed = "import".len() + quote_at + specifier_len + 2;
    if text[consumed..].starts_with(';') {
        consumed += 1;
    }

    let clause = after[..quote_at].trim();
    let import = format!("await import('{}')", specifier.replace('\'', "\\'"));
    if clause.is_empty() {
        return Some((format!("{};", import), consumed));
    }
    let clause = clause.strip_suffix("from")?.trim_end();
    Some((bindings(clause, &import)?, consumed))
}

fn bindings(clause: &str, import: &str) -> Option<String> {
    let (default, rest) = match clause.find(['{', '*']) {
        Some(0) => (None, clause),
        Some(at) => {
            let default = clause[..at].trim().strip_suffix(',')?.trim();
            (Some(default), &clause[at..])
        }
        None => (Some(clause), ""),
    };
    if let Some(name) = default {
        if !is_identifier(name) {
            return None;
        }
    }

    if rest.is_empty() {
        return Some(format!("const {} = ({}).default;", default?, import));
    }

    if let Some(namespace) = rest.strip_prefix('*') {
        let namespace = namespace.trim().strip_prefix("as")?.trim();
        if !is_identifier(namespace) {
            return None;
        }
        return Some(match default {
            Some(default) => format!(
                "const {} = {}; const {} = {}.default;",
                namespace, import, default, namespace
            ),
            None => format!("const {} = {};", namespace, import),
        });
    }

    let names = rest.strip_prefix('{')?.strip_suffix('}')?;
    let mut pattern = Vec::new();
    if let Some(default) = default {
        pattern.push(format!("default: {}", default));
    }
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let mut parts = name.split_whitespace();
        let binding = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(imported), None, None, None) if is_identifier(imported) => imported.to_string(),
            (Some(imported), Some("as"), Some(local), None) if is_identifier(local) => {
                format!("{}: {}", imported, local)
            }
            _ => return None,
        };
        pattern.push(binding);
    }
    Some(format!("const {{ {} }} = {};", pattern.join(", "), import))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_namespace() {
        assert_eq!(
            rewrite("import fs from 'fs'\nconsole.log(1)"),
            "const fs = (await import('fs')).default;\nconsole.log(1)"
        );
        assert_eq!(
            rewrite("import * as path from \"node:path\";"),
            "const path = await import('node:path');"
        );
        assert_eq!(
            rewrite("import fs, * as all from 'node:fs'"),
            "const all = await import('node:fs'); const fs = all.default;"
        );
    }

    #[test]
    fn test_named_imports() {
        assert_eq!(
            rewrite("  import { readFile, writeFile as write } from 'node:fs/promises';"),
            "  const { readFile, writeFile: write } = await import('node:fs/promises');"
        );
        assert_eq!(
            rewrite("import path, { join } from 'path'"),
            "const { default: path, join } = await import('path');"
        );
    }

    #[test]
    fn test_multiline_keeps_line_numbers() {
        let source = "import {\n  join,\n  dirname,\n} from 'path'\nthrow new Error('line 5')\n";
        let rewritten = rewrite(source);
        assert_eq!(
            rewritten,
            "const { join, dirname } = await import('path');\n\n\n\nthrow new Error('line 5')\n"
        );
        assert_eq!(rewritten.lines().count(), source.lines().count());
    }

    #[test]
    fn test_side_effect_import() {
        assert_eq!(rewrite("import 'node:fs';"), "await import('node:fs');");
    }

    #[test]
    fn test_leaves_other_code_alone() {
        for source in [
            "const m = await import('node:fs')",
            "import.meta",
            "importantValue = 1",
            "console.log(\"import x from 'y'\")",
            "import { a-b } from 'x'",
            "import 42 from 'x'",
        ] {
            assert_eq!(rewrite(source), source, "{}", source);
        }
    }
}
