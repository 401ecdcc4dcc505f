// Local CI harness — builds the project's images in dependency order and
// runs the CI suite inside a privileged docker-in-docker container.

mod images;
mod runner;

pub use images::{ImageInfo, build_plan};
pub use runner::{CiOptions, ensure_prerequisites, run_ci};
