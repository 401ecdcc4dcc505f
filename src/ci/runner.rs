use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gitutil;

use super::images;

/// Docker-in-docker image the CI container runs. Building it is the host's
/// job; the build plan skips it.
const DIND_IMAGE: &str = "dind-dev";

/// Where the repository's git directory is mounted inside the CI container.
const MOUNTED_GIT: &str = "/home/dockeruser/src-git/src-git-repo";

/// Where the CRLF-normalized CI script is mounted inside the container.
const MOUNTED_SCRIPT: &str = "/home/dockeruser/ci-script";

const INNER_USER: &str = "dockeruser";

/// How long to wait for the inner docker daemon to accept connections.
const DAEMON_TIMEOUT: Duration = Duration::from_secs(90);
const DAEMON_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct CiOptions {
    /// Override the derived container name.
    pub container_name: Option<String>,
    /// Leave the CI container running afterwards for inspection.
    pub keep_container: bool,
    /// Override the configured image-definitions directory (relative to
    /// the repository root).
    pub images_dir: Option<String>,
}

/// Run the repository's CI suite locally inside a privileged
/// docker-in-docker container.
///
/// The working tree (including uncommitted changes) is snapshotted as a
/// commit, cloned into the container from the read-only mounted git
/// directory, the repository's docker images are built inside the inner
/// daemon in dependency order, and the CI script runs from the clone with
/// its output streamed live and teed to a log. Any `reports_*.tar.gz` the
/// script produces is bundled together with that log under `.ci-reports/`.
/// Returns the CI script's exit code.
pub fn run_ci(cfg: &Config, opts: &CiOptions) -> Result<i32> {
    ensure_prerequisites()?;

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let root = gitutil::repo_root(&cwd)?;
    let identity = project_identity(&root);
    let container = opts
        .container_name
        .clone()
        .unwrap_or_else(|| format!("ci_{identity}"));
    let volume = format!("{identity}_lib_docker");

    let snapshot = gitutil::capture_working_tree_commit(&root)?;
    info!(commit = %snapshot.commit, "running CI against working-tree snapshot");

    let result = run_ci_inner(cfg, &root, &container, &volume, &snapshot.commit, opts);

    if snapshot.needs_ref_cleanup {
        gitutil::cleanup_working_tree_ref(&root);
    }
    result
}

fn run_ci_inner(
    cfg: &Config,
    root: &Path,
    container: &str,
    volume: &str,
    commit: &str,
    opts: &CiOptions,
) -> Result<i32> {
    // The docker-layer volume is shared across runs of the same project so
    // inner images stay cached; anything still holding it must go first.
    ensure_volume(volume)?;
    stop_containers_using_volume(volume)?;
    remove_container_if_exists(container);

    let images_dir = effective_images_dir(cfg, opts);
    let plan = images::build_plan(&root.join(images_dir))?;
    build_host_dind_image(&plan)?;

    let git_dir = resolve_git_dir(root)?;
    let script_dir = tempfile::tempdir().context("failed to create script directory")?;
    let script_path = normalize_ci_script(root, &cfg.ci_script, script_dir.path())?;

    start_ci_container(container, volume, &git_dir, &script_path)?;
    let outcome = (|| -> Result<i32> {
        wait_for_inner_docker(container)?;
        clone_snapshot(cfg, container, commit)?;
        build_inner_images(cfg, images_dir, &plan, container)?;

        let log_path = root.join(".ci-reports").join("ci_test.log.tmp");
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let code = stream_ci_script(cfg, container, &log_path)?;
        collect_reports(cfg, root, container, &log_path, code == 0)?;
        Ok(code)
    })();

    if opts.keep_container {
        info!(%container, "leaving CI container running");
    } else {
        remove_container_if_exists(container);
    }
    outcome
}

/// Fail fast if the host tooling is missing.
pub fn ensure_prerequisites() -> Result<()> {
    for tool in ["docker", "git"] {
        let available = Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            bail!("`{tool}` is required but not available on PATH");
        }
    }
    Ok(())
}

/// Stable per-project identifier: the folder name plus a checksum of the
/// absolute path, so same-named checkouts in different places never share
/// containers or volumes.
fn project_identity(root: &Path) -> String {
    let folder = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let folder: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut crc = flate2::Crc::new();
    crc.update(root.to_string_lossy().as_bytes());
    format!("{folder}_{:08x}", crc.sum())
}

/// The git directory to mount: the common dir, so linked worktrees share
/// the main repository's objects and refs.
fn resolve_git_dir(root: &Path) -> Result<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--git-common-dir"])
        .current_dir(root)
        .output()
        .context("failed to invoke git")?;
    if !output.status.success() {
        bail!("{} is not inside a git repository", root.display());
    }
    let dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    Ok(if dir.is_absolute() {
        dir
    } else {
        root.join(dir)
    })
}

/// Copy the CI script into `dest_dir` with CRLF line endings normalized to
/// LF, so a Windows checkout still produces a script bash will run.
fn normalize_ci_script(root: &Path, script: &str, dest_dir: &Path) -> Result<PathBuf> {
    let source = root.join(script);
    let contents = std::fs::read(&source)
        .with_context(|| format!("failed to read CI script {}", source.display()))?;
    let normalized: Vec<u8> = {
        let mut out = Vec::with_capacity(contents.len());
        let mut bytes = contents.iter().peekable();
        while let Some(&b) = bytes.next() {
            if b == b'\r' && bytes.peek() == Some(&&b'\n') {
                continue;
            }
            out.push(b);
        }
        out
    };
    let dest = dest_dir.join("ci-script");
    std::fs::write(&dest, normalized)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(dest)
}

fn ensure_volume(volume: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["volume", "create", volume])
        .output()
        .context("failed to invoke docker")?;
    if !output.status.success() {
        bail!(
            "failed to create volume {volume}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Stop and remove any container still attached to the docker-layer
/// volume; a stale daemon holding it would corrupt the shared layers.
fn stop_containers_using_volume(volume: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["ps", "-aq", "--filter", &format!("volume={volume}")])
        .output()
        .context("failed to invoke docker")?;
    for id in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        debug!(%id, %volume, "removing container holding CI volume");
        remove_container_if_exists(id);
    }
    Ok(())
}

/// `docker rm -f`, errors suppressed; absence is the goal.
fn remove_container_if_exists(name: &str) {
    let _ = Command::new("docker")
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

fn start_ci_container(
    container: &str,
    volume: &str,
    git_dir: &Path,
    script_path: &Path,
) -> Result<()> {
    let output = Command::new("docker")
        .args(["run", "--privileged", "-d", "--name", container])
        .args(["-v", &format!("{volume}:/var/lib/docker")])
        .args(["-v", &format!("{}:{MOUNTED_GIT}:ro", git_dir.display())])
        .args([
            "-v",
            &format!("{}:{MOUNTED_SCRIPT}:ro", script_path.display()),
        ])
        .arg(DIND_IMAGE)
        .output()
        .context("failed to invoke docker")?;
    if !output.status.success() {
        bail!(
            "failed to start CI container: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!(%container, "started CI container");
    Ok(())
}

/// Poll the inner daemon until `docker info` succeeds inside the container.
fn wait_for_inner_docker(container: &str) -> Result<()> {
    let deadline = Instant::now() + DAEMON_TIMEOUT;
    loop {
        let ready = Command::new("docker")
            .args(["exec", "-u", INNER_USER, container, "docker", "info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if ready {
            debug!(%container, "inner docker daemon is up");
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("inner docker daemon did not come up within {DAEMON_TIMEOUT:?}");
        }
        std::thread::sleep(DAEMON_POLL);
    }
}

fn exec_checked(container: &str, args: &[&str]) -> Result<()> {
    let output = Command::new("docker")
        .args(["exec", "-u", INNER_USER, container])
        .args(args)
        .output()
        .context("failed to invoke docker")?;
    if !output.status.success() {
        bail!(
            "`{}` failed in {container}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Clone the mounted repository inside the container and check out the
/// snapshot commit.
fn clone_snapshot(cfg: &Config, container: &str, commit: &str) -> Result<()> {
    info!(%commit, "cloning snapshot into CI container");
    exec_checked(
        container,
        &["git", "clone", "--quiet", MOUNTED_GIT, &cfg.ci_clone_dir],
    )?;
    exec_checked(
        container,
        &["git", "-C", &cfg.ci_clone_dir, "checkout", "--quiet", commit],
    )?;
    Ok(())
}

/// The image-definitions directory, with a per-invocation override taking
/// precedence over config.
fn effective_images_dir<'a>(cfg: &'a Config, opts: &'a CiOptions) -> &'a str {
    opts.images_dir.as_deref().unwrap_or(&cfg.ci_images_dir)
}

/// The build context for the plan's docker-in-docker entry. A missing or
/// inactive definition is a configuration error, reported before any
/// container is launched.
fn dind_build_dir(plan: &[(String, PathBuf)]) -> Result<&Path> {
    plan.iter()
        .find(|(name, _)| name == DIND_IMAGE)
        .map(|(_, dir)| dir.as_path())
        .with_context(|| {
            format!("no active `{DIND_IMAGE}` image definition found in the build plan")
        })
}

/// Build the docker-in-docker image on the host so `docker run` does not
/// fail with an image-not-found error on a fresh machine.
fn build_host_dind_image(plan: &[(String, PathBuf)]) -> Result<()> {
    let dir = dind_build_dir(plan)?;
    info!(image = DIND_IMAGE, "building host dind image");
    let output = Command::new("docker")
        .args(["build", "-t", DIND_IMAGE])
        .arg(dir)
        .output()
        .context("failed to invoke docker")?;
    if !output.status.success() {
        bail!(
            "failed to build {DIND_IMAGE} from {}: {}",
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Build the project's images inside the inner daemon in dependency order.
fn build_inner_images(
    cfg: &Config,
    images_dir: &str,
    plan: &[(String, PathBuf)],
    container: &str,
) -> Result<()> {
    for (name, dir) in plan {
        if name == DIND_IMAGE {
            continue;
        }
        let Some(subdir) = dir.file_name() else {
            continue;
        };
        let context_dir = format!(
            "{}/{}/{}",
            cfg.ci_clone_dir,
            images_dir,
            subdir.to_string_lossy()
        );
        info!(image = %name, "building image inside CI container");
        exec_checked(container, &["docker", "build", "-t", name, &context_dir])?;
    }
    Ok(())
}

/// Run the CI script from the clone, streaming its output to the terminal
/// while teeing every line into `log_path`. Returns the script exit code.
fn stream_ci_script(cfg: &Config, container: &str, log_path: &Path) -> Result<i32> {
    let log = File::create(log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log = Arc::new(Mutex::new(log));

    let mut child: Child = Command::new("docker")
        .args(["exec", "-u", INNER_USER, "-w", &cfg.ci_clone_dir, container])
        .args(["bash", MOUNTED_SCRIPT])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to start CI script")?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let out_log = Arc::clone(&log);
    let out_thread = std::thread::spawn(move || tee_lines(stdout, out_log, false));
    let err_log = Arc::clone(&log);
    let err_thread = std::thread::spawn(move || tee_lines(stderr, err_log, true));

    let status = child.wait().context("failed to wait for CI script")?;
    let _ = out_thread.join();
    let _ = err_thread.join();
    Ok(status.code().unwrap_or(-1))
}

fn tee_lines<R: std::io::Read>(reader: R, log: Arc<Mutex<File>>, to_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Some(Ok(line)) = lines.next() {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        if let Ok(mut file) = log.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Bundle the newest in-container `reports_*.tar.gz` (if any) together with
/// the CI log into `.ci-reports/ci_reports_{PASSED|FAILED}_{suffix}.tar.gz`.
fn collect_reports(
    cfg: &Config,
    root: &Path,
    container: &str,
    log_path: &Path,
    passed: bool,
) -> Result<()> {
    let reports_dir = root.join(".ci-reports");
    std::fs::create_dir_all(&reports_dir)
        .with_context(|| format!("failed to create {}", reports_dir.display()))?;

    let staging = tempfile::tempdir().context("failed to create staging directory")?;
    let inner = fetch_inner_reports(cfg, container, staging.path());
    let suffix = inner
        .as_deref()
        .and_then(report_suffix)
        .unwrap_or_else(timestamp_suffix);

    if let Some(archive) = &inner {
        let file = File::open(archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        let mut unpacker = tar::Archive::new(flate2::read::GzDecoder::new(file));
        unpacker
            .unpack(staging.path().join("contents"))
            .context("failed to unpack inner report archive")?;
    } else {
        std::fs::create_dir_all(staging.path().join("contents"))?;
    }
    std::fs::copy(
        log_path,
        staging
            .path()
            .join("contents")
            .join(format!("ci_test_{suffix}.out")),
    )
    .context("failed to add CI log to report bundle")?;

    let verdict = if passed { "PASSED" } else { "FAILED" };
    let bundle = reports_dir.join(format!("ci_reports_{verdict}_{suffix}.tar.gz"));
    let out = File::create(&bundle)
        .with_context(|| format!("failed to create {}", bundle.display()))?;
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", staging.path().join("contents"))
        .context("failed to build report bundle")?;
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .context("failed to finalize report bundle")?;

    let _ = std::fs::remove_file(log_path);
    info!(bundle = %bundle.display(), "wrote CI report bundle");
    Ok(())
}

/// Copy the newest `reports_*.tar.gz` out of the clone directory. Missing
/// reports are not fatal — the log alone still gets bundled.
fn fetch_inner_reports(cfg: &Config, container: &str, dest_dir: &Path) -> Option<PathBuf> {
    let listing = Command::new("docker")
        .args(["exec", "-u", INNER_USER, container, "sh", "-c"])
        .arg(format!(
            "ls -1t {}/reports_*.tar.gz 2>/dev/null | head -n1",
            cfg.ci_clone_dir
        ))
        .output()
        .ok()?;
    let newest = String::from_utf8_lossy(&listing.stdout).trim().to_string();
    if newest.is_empty() {
        warn!("CI script produced no reports archive");
        return None;
    }
    let file_name = newest.rsplit('/').next()?.to_string();
    let dest = dest_dir.join(&file_name);
    let copied = Command::new("docker")
        .args(["cp", &format!("{container}:{newest}")])
        .arg(&dest)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !copied {
        warn!(%newest, "failed to copy reports archive out of container");
        return None;
    }
    Some(dest)
}

/// Extract `{suffix}` from an inner archive named `reports_{suffix}.tar.gz`.
fn report_suffix(archive: &Path) -> Option<String> {
    let name = archive.file_name()?.to_str()?;
    let suffix = name.strip_prefix("reports_")?.strip_suffix(".tar.gz")?;
    if suffix.is_empty() {
        None
    } else {
        Some(suffix.to_string())
    }
}

fn timestamp_suffix() -> String {
    chrono::Local::now().format("%Y%m%d_%H_%M_%S_%3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_identity_is_stable_and_path_sensitive() {
        let a = project_identity(Path::new("/home/u/proj"));
        let b = project_identity(Path::new("/home/u/proj"));
        let c = project_identity(Path::new("/tmp/proj"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("proj_"));
    }

    #[test]
    fn project_identity_sanitizes_folder_name() {
        let id = project_identity(Path::new("/home/u/my repo!"));
        assert!(id.starts_with("my_repo__"));
    }

    #[test]
    fn normalize_ci_script_strips_crlf() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("ci-test"), b"#!/bin/bash\r\necho hi\r\n").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let path = normalize_ci_script(root.path(), "ci-test", dest.path()).unwrap();
        let contents = std::fs::read(path).unwrap();
        assert_eq!(contents, b"#!/bin/bash\necho hi\n");
    }

    #[test]
    fn normalize_ci_script_keeps_lone_carriage_returns() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("ci-test"), b"printf 'a\rb'\n").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let path = normalize_ci_script(root.path(), "ci-test", dest.path()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"printf 'a\rb'\n");
    }

    #[test]
    fn normalize_ci_script_requires_the_script() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(normalize_ci_script(root.path(), "missing", dest.path()).is_err());
    }

    #[test]
    fn dind_build_dir_finds_the_plan_entry() {
        let plan = vec![
            ("base".to_string(), PathBuf::from("/images/base")),
            (DIND_IMAGE.to_string(), PathBuf::from("/images/dind")),
        ];
        assert_eq!(dind_build_dir(&plan).unwrap(), Path::new("/images/dind"));
    }

    #[test]
    fn missing_dind_definition_is_a_configuration_error() {
        let plan = vec![("base".to_string(), PathBuf::from("/images/base"))];
        let err = dind_build_dir(&plan).unwrap_err();
        assert!(err.to_string().contains(DIND_IMAGE));
    }

    #[test]
    fn images_dir_override_beats_config() {
        let cfg = Config::default();
        let mut opts = CiOptions::default();
        assert_eq!(effective_images_dir(&cfg, &opts), cfg.ci_images_dir);
        opts.images_dir = Some("custom/images".to_string());
        assert_eq!(effective_images_dir(&cfg, &opts), "custom/images");
    }

    #[test]
    fn report_suffix_parses_inner_archive_names() {
        assert_eq!(
            report_suffix(Path::new("/x/reports_20250101_ab12.tar.gz")).as_deref(),
            Some("20250101_ab12")
        );
        assert_eq!(report_suffix(Path::new("/x/reports_.tar.gz")), None);
        assert_eq!(report_suffix(Path::new("/x/other.tar.gz")), None);
    }

    #[test]
    fn timestamp_suffix_shape() {
        let suffix = timestamp_suffix();
        // YYYYMMDD_HH_MM_SS_mmm
        assert_eq!(suffix.len(), "20250101_12_00_00_000".len());
        assert_eq!(suffix.matches('_').count(), 4);
    }
}
