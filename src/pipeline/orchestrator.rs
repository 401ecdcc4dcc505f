use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::info;

use crate::chain;
use crate::config::{Config, PipelineStep};

use super::commands::prettier_command;

/// Render pipeline steps into a single chain expression.
///
/// Steps join with `&&`; a `retry_once` step contributes `X || X`. The
/// operators stay flat (no grouping), so a failed step's exit code remains
/// visible to every following operator — exactly the chainer's semantics.
pub fn build_chain(steps: &[PipelineStep]) -> String {
    steps
        .iter()
        .filter(|step| !step.command.trim().is_empty())
        .map(|step| {
            if step.retry_once {
                format!("{} || {}", step.command, step.command)
            } else {
                step.command.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Run the fix/format/lint pipeline from the project root and return the
/// exit code of the last executed step.
pub fn run_pipeline(cfg: &Config, project_root: &Path) -> Result<i32> {
    let expression = build_chain(&cfg.steps);
    if expression.is_empty() {
        info!("pipeline has no steps configured");
        return Ok(0);
    }
    info!(root = %project_root.display(), "running pipeline");
    chain::run_in(&expression, Some(project_root))
}

/// Run Prettier inside a container against the project root, inheriting
/// stdio so its diagnostics reach the terminal directly.
pub fn run_prettier(cfg: &Config, project_root: &Path, extra_args: &[String]) -> Result<i32> {
    let args = prettier_command(cfg, project_root, extra_args);
    info!("running: docker {}", shell_words::join(&args));
    let status = Command::new("docker")
        .args(&args)
        .current_dir(project_root)
        .status()
        .context("failed to invoke `docker` — is it installed and on PATH?")?;
    Ok(status.code().unwrap_or(-1))
}
