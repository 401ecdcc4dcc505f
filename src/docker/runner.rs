use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::{DockerError, Result};
use super::naming::{encode_base54, sanitize_container_name};
use super::stream::{ContainerFile, FileMode};
use super::view::UserView;

/// Longest sanitized image-name prefix kept in a generated container name.
const NAME_PREFIX_MAX: usize = 39;

/// Grace period for the container's interactive shell to exit before the
/// process is killed and the container force-removed.
const EXIT_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Launch configuration for a [`ContainerRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub image: String,
    pub auto_cleanup: bool,
    pub run_args: Vec<String>,
    pub skip_handshake: bool,
}

impl RunnerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            auto_cleanup: true,
            run_args: Vec::new(),
            skip_handshake: false,
        }
    }

    /// Disable `--rm` and the forced-removal safety net on teardown.
    pub fn auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    /// Extra flags for `docker run` (e.g. `-e VAR=value`).
    pub fn run_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Skip the echo handshake. Needed for images whose entrypoint is not
    /// an interactive shell (databases, servers).
    pub fn skip_handshake(mut self, skip: bool) -> Self {
        self.skip_handshake = skip;
        self
    }
}

/// Options for a single `docker exec` invocation.
///
/// Output capture defaults to on — the inverse of `std::process` — because
/// callers overwhelmingly want captured output for assertions.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub exec_args: Vec<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub capture: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self {
            exec_args: Vec::new(),
            user: None,
            workdir: None,
            capture: true,
        }
    }

    /// Extra flags for `docker exec` (e.g. `-t`).
    pub fn exec_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one command executed inside a container.
#[derive(Debug)]
pub struct ExecOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The long-lived `docker run -i` process a runner keeps for the
/// container's lifetime. Commands never go through these pipes (each `run`
/// is an independent `docker exec`); they exist to hold the container open
/// and to shut it down.
#[derive(Debug)]
struct LifecycleProc {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Owns exactly one live container and provides command execution, file
/// copy, and file-stream primitives against it.
///
/// A runner is started with [`ContainerRunner::start`] and released with
/// [`shutdown`]; dropping an unreleased runner performs the same teardown
/// best-effort. The generated container name is unique per instantiation
/// (sanitized image prefix plus 16 random bytes in base-54), so independent
/// runners never share a container.
///
/// [`shutdown`]: ContainerRunner::shutdown
#[derive(Debug)]
pub struct ContainerRunner {
    image: String,
    name: String,
    auto_cleanup: bool,
    proc: Option<LifecycleProc>,
    home_dirs: Mutex<HashMap<String, String>>,
    default_identity: OnceLock<(String, String)>,
}

impl ContainerRunner {
    /// Launch the container and verify the echo handshake.
    ///
    /// On any failure — spawn error, handshake mismatch, closed pipe — the
    /// partially-created container is force-removed (errors suppressed)
    /// before the error propagates, so a half-initialized container is
    /// never leaked.
    pub fn start(config: RunnerConfig) -> Result<Self> {
        let base = sanitize_container_name(&config.image, Some(NAME_PREFIX_MAX))?;
        let suffix = encode_base54(uuid::Uuid::new_v4().as_bytes());
        let name = format!("{base}_{suffix}");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-i"]);
        if config.auto_cleanup {
            cmd.arg("--rm");
        }
        cmd.args(&config.run_args);
        cmd.args(["--name", &name]);
        cmd.arg(&config.image);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(container = %name, image = %config.image, "starting container");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(DockerError::InitializationFailed(format!(
                    "failed to spawn `docker run` for image '{}': {e}",
                    config.image
                )));
            }
        };
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        let mut runner = Self {
            image: config.image,
            name,
            auto_cleanup: config.auto_cleanup,
            proc: Some(LifecycleProc {
                child,
                stdin,
                stdout,
            }),
            home_dirs: Mutex::new(HashMap::new()),
            default_identity: OnceLock::new(),
        };

        if !config.skip_handshake
            && let Err(e) = runner.handshake()
        {
            runner.abort_startup();
            return Err(e);
        }
        Ok(runner)
    }

    fn handshake(&mut self) -> Result<()> {
        let proc = self
            .proc
            .as_mut()
            .ok_or(DockerError::InvalidState("handshake"))?;
        proc.stdin
            .write_all(b"echo Hi\n")
            .and_then(|()| proc.stdin.flush())
            .map_err(|e| DockerError::InitializationFailed(format!("handshake write: {e}")))?;

        let mut line = String::new();
        proc.stdout
            .read_line(&mut line)
            .map_err(|e| DockerError::InitializationFailed(format!("handshake read: {e}")))?;
        if line.trim() != "Hi" {
            return Err(DockerError::InitializationFailed(format!(
                "expected 'Hi', but got '{}'",
                line.trim()
            )));
        }
        Ok(())
    }

    /// Kill the lifecycle process and force-remove the container,
    /// suppressing all errors. Only used on failed startup.
    fn abort_startup(&mut self) {
        if let Some(mut proc) = self.proc.take() {
            let _ = proc.child.kill();
            let _ = proc.child.wait();
        }
        force_remove_container(&self.name);
    }

    pub fn container_name(&self) -> &str {
        &self.name
    }

    pub fn image_name(&self) -> &str {
        &self.image
    }

    /// Execute a command inside the container via `docker exec`.
    ///
    /// Returns the exit code and captured output; a non-zero exit is *not*
    /// an error here (see [`run_checked`]).
    ///
    /// [`run_checked`]: ContainerRunner::run_checked
    pub fn run(&self, cmd: &[&str], opts: &RunOptions) -> Result<ExecOutput> {
        let mut docker = Command::new("docker");
        docker.arg("exec");
        docker.args(&opts.exec_args);
        if let Some(user) = &opts.user {
            docker.args(["-u", user]);
        }
        if let Some(workdir) = &opts.workdir {
            docker.args(["-w", workdir]);
        }
        docker.arg(&self.name);
        docker.args(cmd);

        if opts.capture {
            let output = docker.output()?;
            Ok(ExecOutput {
                status: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = docker.status()?;
            Ok(ExecOutput {
                status: status.code(),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    /// Like [`run`], but a non-zero exit becomes [`DockerError::CommandFailed`]
    /// carrying the captured stderr.
    ///
    /// [`run`]: ContainerRunner::run
    pub fn run_checked(&self, cmd: &[&str], opts: &RunOptions) -> Result<ExecOutput> {
        let output = self.run(cmd, opts)?;
        if !output.success() {
            return Err(DockerError::CommandFailed {
                command: cmd.join(" "),
                code: output.status,
                stderr: output.stderr_text().trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Copy a path out of the container with `docker cp`.
    pub fn copy_from(&self, container_path: &str, host_path: &Path) -> Result<()> {
        let source = format!("{}:{container_path}", self.name);
        let output = Command::new("docker")
            .args(["cp", &source])
            .arg(host_path)
            .output()?;
        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                command: format!("docker cp {source} {}", host_path.display()),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Copy one or more host paths into the container with `docker cp`.
    /// Files land owned by the container's default user (usually root);
    /// use [`UserView::copy_to`] for ownership-aware transfer.
    pub fn copy_to<P: AsRef<Path>>(&self, host_paths: &[P], container_path: &str) -> Result<()> {
        let dest = format!("{}:{container_path}", self.name);
        let mut cmd = Command::new("docker");
        cmd.arg("cp");
        for path in host_paths {
            cmd.arg(path.as_ref());
        }
        cmd.arg(&dest);
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                command: format!("docker cp ... {dest}"),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Open a file inside the container as a byte stream.
    ///
    /// A relative `path` is resolved against `opts.workdir` when one is
    /// set. Read mode fails fast with [`DockerError::FileNotFound`] if the
    /// path does not exist at open time.
    pub fn open(&self, path: &str, mode: FileMode, opts: &RunOptions) -> Result<ContainerFile> {
        let resolved = resolve_path(path, opts.workdir.as_deref());
        ContainerFile::open(
            self,
            resolved,
            mode,
            opts.user.as_deref(),
            opts.workdir.as_deref(),
        )
    }

    /// Recursively create directories, mirroring `mkdir -p` semantics when
    /// `exist_ok` is set; without it an existing leaf is a
    /// [`DockerError::CommandFailed`].
    pub fn makedirs(&self, path: &str, exist_ok: bool, opts: &RunOptions) -> Result<()> {
        let mut cmd = vec!["mkdir"];
        if exist_ok {
            cmd.push("-p");
        }
        cmd.push(path);
        self.run_checked(&cmd, opts)?;
        Ok(())
    }

    /// Resolve (and memoize per username) a user's home directory by
    /// expanding `~` as that user.
    pub fn get_home_dir(&self, username: &str) -> Result<String> {
        if let Ok(cache) = self.home_dirs.lock()
            && let Some(home) = cache.get(username)
        {
            return Ok(home.clone());
        }
        let output = self.run_checked(&["sh", "-c", "echo ~"], &RunOptions::new().user(username))?;
        let home = output.stdout_text().trim().to_string();
        if let Ok(mut cache) = self.home_dirs.lock() {
            cache.insert(username.to_string(), home.clone());
        }
        Ok(home)
    }

    /// A view for the container's default user and its current directory,
    /// discovered once and memoized for the runner's lifetime.
    pub fn default_view(&self) -> Result<UserView<'_>> {
        let (user, cwd) = match self.default_identity.get() {
            Some(identity) => identity.clone(),
            None => {
                let user = self
                    .run_checked(&["id", "-un"], &RunOptions::new())?
                    .stdout_text()
                    .trim()
                    .to_string();
                let cwd = self
                    .run_checked(&["pwd"], &RunOptions::new())?
                    .stdout_text()
                    .trim()
                    .to_string();
                let _ = self.default_identity.set((user.clone(), cwd.clone()));
                (user, cwd)
            }
        };
        Ok(UserView::preresolved(self, user, cwd))
    }

    /// A view bound to `username`, starting in `workdir` (the user's home
    /// when omitted).
    pub fn use_as(&self, username: &str, workdir: Option<&str>) -> Result<UserView<'_>> {
        UserView::new(self, username, workdir)
    }

    /// Gracefully release the container: send the exit command, wait up to
    /// the grace period, then kill the process and (with auto-cleanup)
    /// force-remove the container as a safety net, since `--rm` may not
    /// have completed.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        let Some(proc) = self.proc.take() else {
            return;
        };
        let LifecycleProc {
            mut child,
            mut stdin,
            stdout,
        } = proc;

        let _ = stdin.write_all(b"exit 0\n");
        let _ = stdin.flush();
        drop(stdin);
        drop(stdout);

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(container = %self.name, ?status, "container exited");
                    return;
                }
                Ok(None) => {}
                Err(_) => break,
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL);
        }

        warn!(container = %self.name, "container did not exit in time, killing");
        let _ = child.kill();
        let _ = child.wait();
        if self.auto_cleanup {
            force_remove_container(&self.name);
        }
    }
}

impl Drop for ContainerRunner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// `docker rm -f`, best-effort: cleanup must never mask the original
/// failure, so all errors are suppressed.
fn force_remove_container(name: &str) {
    let _ = Command::new("docker")
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Join a relative path onto a workdir, trimming doubled slashes.
fn resolve_path(path: &str, workdir: Option<&str>) -> String {
    match workdir {
        Some(workdir) if !path.starts_with('/') => {
            format!(
                "{}/{}",
                workdir.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_joins_relative_onto_workdir() {
        assert_eq!(resolve_path("a.txt", Some("/home/u")), "/home/u/a.txt");
        assert_eq!(resolve_path("a.txt", Some("/home/u/")), "/home/u/a.txt");
    }

    #[test]
    fn resolve_path_leaves_absolute_alone() {
        assert_eq!(resolve_path("/etc/hosts", Some("/home/u")), "/etc/hosts");
        assert_eq!(resolve_path("/etc/hosts", None), "/etc/hosts");
    }

    #[test]
    fn resolve_path_without_workdir_is_identity() {
        assert_eq!(resolve_path("rel/file", None), "rel/file");
    }

    #[test]
    fn run_options_capture_defaults_on() {
        assert!(RunOptions::new().capture);
        assert!(RunOptions::default().capture);
    }

    #[test]
    fn runner_config_builder_round_trip() {
        let cfg = RunnerConfig::new("alpine:latest")
            .auto_cleanup(false)
            .run_args(["-e", "X=1"])
            .skip_handshake(true);
        assert_eq!(cfg.image, "alpine:latest");
        assert!(!cfg.auto_cleanup);
        assert_eq!(cfg.run_args, vec!["-e".to_string(), "X=1".to_string()]);
        assert!(cfg.skip_handshake);
    }

    #[test]
    fn exec_output_success_requires_zero() {
        let ok = ExecOutput {
            status: Some(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let failed = ExecOutput {
            status: Some(1),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let signalled = ExecOutput {
            status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(ok.success());
        assert!(!failed.success());
        assert!(!signalled.success());
    }
}
