use std::path::Path;

use crate::config::Config;

/// Build the `docker run` argument vector for the Prettier step.
///
/// The project root is mounted at the configured container path and
/// Prettier runs against `.` with `--write`; extra args are forwarded
/// verbatim (e.g. `--check` to lint instead of rewriting).
pub fn prettier_command(cfg: &Config, project_root: &Path, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-v".to_string(),
        format!("{}:{}", project_root.display(), cfg.prettier_mount),
        "-w".to_string(),
        format!("{}/.", cfg.prettier_mount),
        cfg.prettier_image.clone(),
        "npx".to_string(),
        "prettier".to_string(),
        ".".to_string(),
        "--write".to_string(),
    ];
    args.extend(extra_args.iter().cloned());
    args
}
