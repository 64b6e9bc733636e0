//! Module access
//!
//! Only a handful of built-in modules can be imported: `fs`, `fs/promises`
//! and `path`, with or without the `node:` prefix. `fs` re-exports the
//! scoped `fs` global, so imports reach exactly what the global does. Every
//! other specifier, `npm:` and `jsr:` packages included, is refused with a
//! `PermissionDenied` error, and so is the `require` global.

use rquickjs::function::Opt;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Coerced, Ctx, Function, Module, Runtime};

use crate::capability::{Capability, CapabilityMetadata};
use crate::errors::permission_denied;
use crate::util;

const FS_MODULE: &str = r#"
const fs = globalThis.fs;
export default fs;
export const {
  readFileSync, writeFileSync, appendFileSync, readdirSync, mkdirSync, rmSync,
  existsSync, statSync, promises,
} = fs;
"#;

const FS_PROMISES_MODULE: &str = r#"
const promises = globalThis.fs.promises;
export default promises;
export const { readFile, writeFile, appendFile, readdir, mkdir, rm, stat } = promises;
"#;

const PATH_MODULE: &str = r#"
export const sep = '/';
export const delimiter = ':';

function assertPath(path) {
  if (typeof path !== 'string') {
    throw new TypeError('The "path" argument must be of type string');
  }
}

function fold(segments, absolute) {
  const out = [];
  for (const segment of segments) {
    if (segment === '' || segment === '.') continue;
    if (segment === '..') {
      if (out.length > 0 && out[out.length - 1] !== '..') out.pop();
      else if (!absolute) out.push('..');
      continue;
    }
    out.push(segment);
  }
  return out;
}

function trimEnd(path) {
  let end = path.length;
  while (end > 1 && path[end - 1] === '/') end--;
  return path.slice(0, end);
}

export function isAbsolute(path) {
  assertPath(path);
  return path.startsWith('/');
}

export function normalize(path) {
  assertPath(path);
  if (path === '') return '.';
  const absolute = isAbsolute(path);
  let result = fold(path.split('/'), absolute).join('/');
  if (result === '' && !absolute) result = '.';
  if (result !== '' && path.endsWith('/')) result += '/';
  return absolute ? '/' + result : result;
}

export function join(...parts) {
  parts.forEach(assertPath);
  const joined = parts.filter((part) => part !== '').join('/');
  return joined === '' ? '.' : normalize(joined);
}

export function resolve(...parts) {
  let resolved = '';
  for (let i = parts.length - 1; i >= 0; i--) {
    assertPath(parts[i]);
    if (parts[i] === '') continue;
    resolved = parts[i] + '/' + resolved;
    if (parts[i].startsWith('/')) break;
  }
  if (!resolved.startsWith('/')) {
    resolved = globalThis.process.cwd() + '/' + resolved;
  }
  return '/' + fold(resolved.split('/'), true).join('/');
}

export function relative(from, to) {
  const a = resolve(from).split('/').filter(Boolean);
  const b = resolve(to).split('/').filter(Boolean);
  let common = 0;
  while (common < a.length && common < b.length && a[common] === b[common]) common++;
  return [...a.slice(common).map(() => '..'), ...b.slice(common)].join('/');
}

export function dirname(path) {
  assertPath(path);
  if (path === '') return '.';
  const trimmed = trimEnd(path);
  const index = trimmed.lastIndexOf('/');
  if (index === -1) return '.';
  if (index === 0) return '/';
  return trimEnd(trimmed.slice(0, index));
}

export function basename(path, ext) {
  assertPath(path);
  const trimmed = trimEnd(path);
  const base = trimmed.slice(trimmed.lastIndexOf('/') + 1);
  if (typeof ext === 'string' && ext !== base && base.endsWith(ext)) {
    return base.slice(0, base.length - ext.length);
  }
  return base;
}

export function extname(path) {
  const base = basename(path);
  const index = base.lastIndexOf('.');
  return index <= 0 ? '' : base.slice(index);
}

const path = {
  sep, delimiter, isAbsolute, normalize, join, resolve, relative, dirname, basename, extname,
};
path.posix = path;
export const posix = Object.freeze(path);
export default posix;
"#;

/// Importable modules, by canonical name
const BUILTINS: &[(&str, &str)] = &[
    ("node:fs", FS_MODULE),
    ("node:fs/promises", FS_PROMISES_MODULE),
    ("node:path", PATH_MODULE),
];

fn denial(name: &str) -> String {
    format!("import of \"{}\" is not allowed in the sandbox", name)
}

/// Canonical name of a built-in module, accepting bare names like `fs`
pub fn builtin_name(specifier: &str) -> Option<&'static str> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    BUILTINS
        .iter()
        .map(|(name, _)| *name)
        .find(|name| name.strip_prefix("node:") == Some(bare))
}

/// Resolver and loader serving the built-in modules and refusing the rest
pub struct BuiltinModules;

impl Resolver for BuiltinModules {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, _base: &str, name: &str) -> rquickjs::Result<String> {
        match builtin_name(name) {
            Some(canonical) => Ok(canonical.to_string()),
            None => Err(permission_denied(ctx, &denial(name))),
        }
    }
}

impl Loader for BuiltinModules {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        match BUILTINS.iter().find(|(builtin, _)| *builtin == name) {
            Some((_, source)) => Module::declare(ctx.clone(), name, *source),
            None => Err(permission_denied(ctx, &denial(name))),
        }
    }
}

pub struct ModuleCapability;

impl Capability for ModuleCapability {
    fn id(&self) -> &'static str {
        "modules"
    }

    fn attach(&self, runtime: &Runtime) -> rquickjs::Result<()> {
        runtime.set_loader(BuiltinModules, BuiltinModules);
        Ok(())
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let require = Function::new(ctx.clone(), |ctx: Ctx<'js>, name: Opt<Coerced<String>>| {
            let name = name.0.map(|Coerced(name)| name).unwrap_or_default();
            Err::<(), _>(permission_denied(&ctx, &denial(&name)))
        })?;
        require.set_name("require")?;
        util::freeze(ctx, &require)?;
        util::define_locked(&ctx.globals(), "require", require)
    }

    fn declarations(&self) -> String {
        r#"/** Always throws PermissionDenied; use `await import('node:fs')` for the built-in modules */
declare function require(name: string): never;
declare module 'node:fs' {
  const fs: typeof globalThis.fs;
  export default fs;
}
declare module 'node:fs/promises' {
  const promises: typeof globalThis.fs.promises;
  export default promises;
}
declare module 'node:path' {
  interface Path {
    readonly sep: '/';
    readonly delimiter: ':';
    readonly posix: Path;
    isAbsolute(path: string): boolean;
    normalize(path: string): string;
    join(...parts: string[]): string;
    resolve(...parts: string[]): string;
    relative(from: string, to: string): string;
    dirname(path: string): string;
    basename(path: string, ext?: string): string;
    extname(path: string): string;
  }
  const path: Path;
  export default path;
}
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.1.0",
            description: "Built-in fs and path modules, every other import denied",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::fs::FsCapability;
    use rquickjs::{Context, Promise};
    use tempfile::TempDir;

    fn sandboxed(dir: &TempDir) -> (Runtime, Context) {
        let runtime = Runtime::new().unwrap();
        ModuleCapability.attach(&runtime).unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            FsCapability::new(dir.path()).install(&ctx).unwrap();
            ModuleCapability.install(&ctx).unwrap();
        });
        (runtime, context)
    }

    /// Evaluates an async expression and returns what it resolves to
    fn settle(context: &Context, source: &str) -> String {
        context.with(|ctx| {
            let promise: Promise = ctx.eval(source).unwrap();
            while ctx.execute_pending_job() {}
            promise.result::<String>().unwrap().unwrap()
        })
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(builtin_name("fs"), Some("node:fs"));
        assert_eq!(builtin_name("node:fs"), Some("node:fs"));
        assert_eq!(builtin_name("fs/promises"), Some("node:fs/promises"));
        assert_eq!(builtin_name("path"), Some("node:path"));
        for denied in ["node:child_process", "os", "npm:lodash", "jsr:@std/path", "./local.js", "node:"] {
            assert_eq!(builtin_name(denied), None, "{}", denied);
        }
    }

    #[test]
    fn test_require_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        context.with(|ctx| {
            let outcome: String = ctx
                .eval(
                    r#"
                    let outcome;
                    try { require('fs') } catch (err) { outcome = err.name + ': ' + err.message }
                    outcome
                    "#,
                )
                .unwrap();
            assert_eq!(outcome, "PermissionDenied: import of \"fs\" is not allowed in the sandbox");
        });
    }

    #[test]
    fn test_other_imports_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        for specifier in ["node:child_process", "os", "npm:lodash", "jsr:@std/fs"] {
            let outcome = settle(
                &context,
                &format!("import('{}').then(() => 'loaded', (err) => err.name)", specifier),
            );
            assert_eq!(outcome, "PermissionDenied", "{}", specifier);
        }
    }

    #[test]
    fn test_prefixed_and_bare_imports_match() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        let outcome = settle(
            &context,
            r#"
            (async () => {
                const bare = await import('fs');
                const prefixed = await import('node:fs');
                const { writeFile, readFile } = await import('node:fs/promises');
                await writeFile('note.txt', 'kept');
                return [
                    bare.default === prefixed.default,
                    prefixed.default === globalThis.fs,
                    await readFile('note.txt'),
                    prefixed.readFileSync('note.txt'),
                ].join(',');
            })()
            "#,
        );
        assert_eq!(outcome, "true,true,kept,kept");
        assert_eq!(std::fs::read_to_string(dir.path().join("note.txt")).unwrap(), "kept");
    }

    #[test]
    fn test_imported_fs_stays_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        let outcome = settle(
            &context,
            r#"
            import('node:fs/promises')
                .then((fs) => fs.readFile('/etc/passwd'))
                .then(() => 'read', (err) => err.name)
            "#,
        );
        assert_eq!(outcome, "PermissionDenied");
    }

    #[test]
    fn test_path_module() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        let outcome = settle(
            &context,
            r#"
            import('path').then(({ default: path }) => JSON.stringify([
                path.join('/a/b', '../c', 'd.txt'),
                path.join('a', '', '.'),
                path.normalize('./x//y/../z/'),
                path.normalize(''),
                path.resolve('/root', 'x', '/abs', 'y'),
                path.relative('/data/a/b', '/data/c'),
                path.dirname('/a/b/'),
                path.dirname('file'),
                path.basename('/a/page.html', '.html'),
                path.extname('archive.tar.gz'),
                path.extname('.env'),
                path.isAbsolute('rel'),
                path.posix === path,
            ]))
            "#,
        );
        assert_eq!(
            outcome,
            r#"["/a/c/d.txt","a","x/z/",".","/abs/y","../../c","/a",".","page",".gz","",false,true]"#
        );
    }

    #[test]
    fn test_require_cannot_be_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, context) = sandboxed(&dir);

        context.with(|ctx| {
            let denied: bool = ctx
                .eval(
                    r#"
                    try { globalThis.require = (name) => ({ name }) } catch (_) {}
                    let denied = false;
                    try { require('child_process') } catch (err) { denied = err.name === 'PermissionDenied' }
                    denied
                    "#,
                )
                .unwrap();
            assert!(denied);
        });
    }
}
