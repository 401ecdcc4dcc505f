use std::io;

use thiserror::Error;

/// Errors produced by the container subsystem.
///
/// Cleanup paths (forced container removal, teardown) never surface errors of
/// their own; only the original failure propagates.
#[derive(Debug, Error)]
pub enum DockerError {
    /// Launch or handshake failure while starting a container. The
    /// partially-created container has already been force-removed.
    #[error("container initialization failed: {0}")]
    InitializationFailed(String),

    /// A caller-supplied argument was rejected before any subprocess ran.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Read-mode open on a path that does not exist in the container, or a
    /// missing host-side source path.
    #[error("no such file: '{path}'")]
    FileNotFound { path: String },

    /// The backing process of a whole-file read exited non-zero.
    #[error("failed to read '{path}' (exit code {code:?}): {stderr}")]
    ReadFailed {
        path: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The in-container tar extraction process exited non-zero.
    #[error("directory transfer into container failed (exit code {code:?})")]
    TransferFailed { code: Option<i32> },

    /// A strictly-checked command exited non-zero.
    #[error("command `{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// An operation was attempted on a stream that is not open for it.
    #[error("stream is not open for {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DockerError>;
