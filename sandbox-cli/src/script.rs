//! Script and input loading

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// Reads a script from a file, or from stdin when the path is `-`
pub fn read_script(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        return Ok(script);
    }

    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Parses the `--input` value
///
/// A value starting with `@` names a JSON file; anything else is JSON text.
pub fn parse_input(input: Option<&str>) -> Result<Option<serde_json::Value>> {
    let Some(input) = input else {
        return Ok(None);
    };

    let text = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path))?,
        None => input.to_string(),
    };

    let value = serde_json::from_str(&text).context("Input is not valid JSON")?;
    Ok(Some(value))
}
