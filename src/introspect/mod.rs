// Environment introspection — small diagnostics for debugging how a CLI
// was invoked, plus PATH dedup.

use serde::Serialize;

/// Snapshot of the invoking environment, printable as JSON.
#[derive(Debug, Serialize)]
pub struct EnvSnapshot {
    pub cwd: String,
    pub args: Vec<String>,
    pub user: Option<String>,
    pub user_home_dir: Option<String>,
    /// `None` on platforms without a uid concept.
    pub is_root: Option<bool>,
    pub os_name: &'static str,
}

impl EnvSnapshot {
    pub fn capture(args: Vec<String>) -> Self {
        Self {
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            args,
            user: std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .ok(),
            user_home_dir: std::env::var("HOME").ok(),
            is_root: effective_root(),
            os_name: std::env::consts::OS,
        }
    }
}

#[cfg(unix)]
fn effective_root() -> Option<bool> {
    // SAFETY: geteuid has no failure modes and touches no memory.
    Some(unsafe { libc::geteuid() } == 0)
}

#[cfg(not(unix))]
fn effective_root() -> Option<bool> {
    None
}

/// Remove duplicate entries from a PATH-style string, keeping first
/// occurrences in order. With `allow_relative` unset, relative entries
/// (anything not starting with `/`) are dropped entirely.
pub fn dedupe_path(path: &str, allow_relative: bool) -> String {
    let mut seen = std::collections::HashSet::new();
    path.split(':')
        .filter(|entry| !entry.is_empty())
        .filter(|entry| allow_relative || entry.starts_with('/'))
        .filter(|entry| seen.insert(entry.to_string()))
        .collect::<Vec<_>>()
        .join(":")
}
