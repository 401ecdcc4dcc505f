use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;

use tracing::debug;

use super::error::{DockerError, Result};
use super::runner::{ContainerRunner, RunOptions};

/// Access mode for a [`ContainerFile`]. Read and write are mutually
/// exclusive; there is no append or read-write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Read => "read",
            FileMode::Write => "write",
        }
    }
}

impl FromStr for FileMode {
    type Err = DockerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(FileMode::Read),
            "write" => Ok(FileMode::Write),
            other => Err(DockerError::InvalidArgument(format!(
                "unsupported file mode: '{other}'"
            ))),
        }
    }
}

/// One open file inside a container, backed by a live `docker exec`
/// subprocess (`cat` for reads, `tee` for writes).
///
/// A stream is single-use: it is open from construction until [`close`]
/// consumes it (or it is dropped). Write mode pipes this process's writes
/// into `tee`; read mode exposes `cat`'s stdout. Reads and writes go
/// through the standard [`io::Read`] / [`io::Write`] impls; sized reads do
/// not await the backing process, while [`read_all`] drains the stream,
/// awaits the process, and reports a non-zero exit as [`DockerError::ReadFailed`].
///
/// [`close`]: ContainerFile::close
/// [`read_all`]: ContainerFile::read_all
#[derive(Debug)]
pub struct ContainerFile {
    path: String,
    mode: FileMode,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ContainerFile {
    /// Spawn the backing subprocess. Read mode first runs a synchronous
    /// `test -f` existence check and fails with [`DockerError::FileNotFound`]
    /// before anything is streamed.
    pub(crate) fn open(
        runner: &ContainerRunner,
        path: String,
        mode: FileMode,
        user: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<Self> {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", "-i"]);
        if let Some(user) = user {
            cmd.args(["-u", user]);
        }
        if let Some(workdir) = workdir {
            cmd.args(["-w", workdir]);
        }
        cmd.arg(runner.container_name());

        debug!(path, mode = mode.as_str(), "opening container file");
        match mode {
            FileMode::Write => {
                cmd.args(["tee", &path]);
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped());
                let mut child = cmd.spawn()?;
                let stdin = child.stdin.take();
                Ok(Self {
                    path,
                    mode,
                    child: Some(child),
                    stdin,
                    stdout: None,
                })
            }
            FileMode::Read => {
                let probe = runner.run(&["test", "-f", &path], &RunOptions::new())?;
                if !probe.success() {
                    return Err(DockerError::FileNotFound { path });
                }
                cmd.args(["cat", &path]);
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                let mut child = cmd.spawn()?;
                let stdout = child.stdout.take();
                Ok(Self {
                    path,
                    mode,
                    child: Some(child),
                    stdin: None,
                    stdout,
                })
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Read the stream to completion, await the backing process, and check
    /// its exit status. This is the only read path that reports a failure
    /// of the backing process; sized reads through [`io::Read`] leave the
    /// process running for the next read.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        if self.mode != FileMode::Read {
            return Err(DockerError::InvalidState("reading"));
        }
        let Some(mut stdout) = self.stdout.take() else {
            return Err(DockerError::InvalidState("reading"));
        };

        let mut data = Vec::new();
        stdout.read_to_end(&mut data)?;
        drop(stdout);

        let Some(mut child) = self.child.take() else {
            return Err(DockerError::InvalidState("reading"));
        };
        let status = child.wait()?;
        if !status.success() {
            return Err(DockerError::ReadFailed {
                path: self.path.clone(),
                code: status.code(),
                stderr: drain_stderr(&mut child),
            });
        }
        Ok(data)
    }

    /// Close the stream: shut the pipes and await the backing process.
    ///
    /// In write mode a non-zero exit from `tee` surfaces as
    /// [`DockerError::CommandFailed`]. In read mode the exit status is not
    /// checked, because closing a partially-read stream kills `cat` with a
    /// broken pipe; use [`read_all`] to get failure feedback on reads.
    ///
    /// [`read_all`]: ContainerFile::read_all
    pub fn close(mut self) -> Result<()> {
        self.shut()
    }

    fn shut(&mut self) -> Result<()> {
        drop(self.stdin.take());
        drop(self.stdout.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if self.mode == FileMode::Write && !status.success() {
            return Err(DockerError::CommandFailed {
                command: format!("tee {}", self.path),
                code: status.code(),
                stderr: drain_stderr(&mut child),
            });
        }
        Ok(())
    }
}

impl Read for ContainerFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file not open for reading",
            )),
        }
    }
}

impl Write for ContainerFile {
    /// Writes to and flushes the subprocess's input pipe, so the data is
    /// visible in the container without waiting for close.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file not open for writing",
            ));
        };
        let written = stdin.write(buf)?;
        stdin.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ContainerFile {
    fn drop(&mut self) {
        // Best-effort: never surface errors from a drop path.
        let _ = self.shut();
    }
}

fn drain_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut text);
    }
    text.trim().to_string()
}
