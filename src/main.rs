use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use devharness::{chain, ci, config, gitutil, introspect, pipeline};

#[derive(Parser)]
#[command(name = "devharness", version, about = "Docker-backed developer tooling")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a bash-style command chain (`a && b || c ; d`).
    Chain {
        /// The chain expression, as one string.
        expression: String,
    },
    /// Run the fix/format/lint pipeline from the project root.
    Fflint,
    /// Run Prettier in a container against the project root.
    Prettify {
        /// Extra arguments forwarded to prettier (e.g. `--check`).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Write the working tree as a git tree object and print its id.
    WriteTree {
        /// Keep the new objects out of the repository (temp object dir).
        #[arg(short, long)]
        ephemeral: bool,
    },
    /// Run the repository's CI suite locally in a docker-in-docker
    /// container.
    Ci {
        /// Override the derived CI container name.
        #[arg(long)]
        container_name: Option<String>,
        /// Leave the CI container running afterwards for inspection.
        #[arg(long)]
        keep_container: bool,
        /// Override the image-definitions directory (relative to the
        /// repository root).
        #[arg(long)]
        images_dir: Option<String>,
    },
    /// Print a JSON snapshot of the invoking environment.
    EchoEnv {
        /// Arguments to echo back in the snapshot.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print PATH (or a given value) with duplicate entries removed.
    DedupePath {
        /// The PATH-style string; defaults to `$PATH`.
        path: Option<String>,
        /// Keep relative entries instead of dropping them.
        #[arg(long)]
        allow_relative: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Cmd::Chain { expression } => {
            let code = chain::run(&expression)?;
            Ok(exit_code(code))
        }
        Cmd::Fflint => {
            let (cfg, root) = load_config()?;
            let code = pipeline::run_pipeline(&cfg, &root)?;
            Ok(exit_code(code))
        }
        Cmd::Prettify { args } => {
            let (cfg, root) = load_config()?;
            let code = pipeline::run_prettier(&cfg, &root, &args)?;
            Ok(exit_code(code))
        }
        Cmd::WriteTree { ephemeral } => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            let root = gitutil::repo_root(&cwd)?;
            let tree = gitutil::write_working_tree(&root, ephemeral)?;
            println!("{tree}");
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Ci {
            container_name,
            keep_container,
            images_dir,
        } => {
            let (cfg, _) = load_config()?;
            let opts = ci::CiOptions {
                container_name,
                keep_container,
                images_dir,
            };
            let code = ci::run_ci(&cfg, &opts)?;
            Ok(exit_code(code))
        }
        Cmd::EchoEnv { args } => {
            let snapshot = introspect::EnvSnapshot::capture(args);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::DedupePath {
            path,
            allow_relative,
        } => {
            let value = match path {
                Some(value) => value,
                None => std::env::var("PATH").context("PATH is not set")?,
            };
            println!("{}", introspect::dedupe_path(&value, allow_relative));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Config from the nearest `.devharness.yaml` up the tree, or defaults.
fn load_config() -> Result<(config::Config, PathBuf)> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let root = config::find_project_root(&cwd);
    let cfg = config::load(&root)?.unwrap_or_default();
    Ok((cfg, root))
}

fn exit_code(code: i32) -> ExitCode {
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(code.clamp(1, 255) as u8)
    }
}
