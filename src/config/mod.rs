mod loader;
mod types;

pub use loader::{CONFIG_FILE, find_project_root, load};
pub use types::{Config, PipelineStep};
