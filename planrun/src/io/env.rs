//! Environment variable sources: `KEY=VALUE` options and dotenv-style
//! files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Parse `KEY=VALUE` pairs given on the command line.
pub fn environment_to_dict(options: &[String]) -> Result<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            bail!("Invalid environment variable specification '{option}'.");
        };
        environment.insert(key.trim().to_string(), value.to_string());
    }
    Ok(environment)
}

/// Read environment variables from dotenv-style files.
///
/// Each file holds one `KEY=VALUE` pair per line; blank lines and `#`
/// comments are skipped. Relative paths are resolved against `root`.
/// Later files override earlier ones.
pub fn environment_files_to_dict(
    files: &[String],
    root: &Path,
) -> Result<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    for file in files {
        let path = if Path::new(file).is_absolute() {
            Path::new(file).to_path_buf()
        } else {
            root.join(file)
        };
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read environment file {}", path.display()))?;
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!(
                    "Invalid line {} in environment file {}: '{line}'.",
                    index + 1,
                    path.display()
                );
            };
            environment.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(environment)
}
