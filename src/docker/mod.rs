// Container orchestration — long-lived runner, per-user views, file streams.

pub mod error;
pub mod naming;
pub mod runner;
pub mod stream;
pub mod view;

pub use error::DockerError;
pub use naming::{encode_base54, sanitize_container_name};
pub use runner::{ContainerRunner, ExecOutput, RunOptions, RunnerConfig};
pub use stream::{ContainerFile, FileMode};
pub use view::UserView;
