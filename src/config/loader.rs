use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::types::Config;

pub const CONFIG_FILE: &str = ".devharness.yaml";

/// Load config from a `.devharness.yaml` in the given directory.
pub fn load(dir: &Path) -> Result<Option<Config>> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(Some(config))
}

/// Walk up from `start` to the nearest ancestor carrying a config file.
/// Falls back to `start` itself when none is found.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start;
    loop {
        if current.join(CONFIG_FILE).is_file() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return start.to_path_buf(),
        }
    }
}
