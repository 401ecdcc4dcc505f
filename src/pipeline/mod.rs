// Fix/format/lint pipeline — renders configured steps into a single chain
// expression and runs it from the project root.

mod commands;
mod orchestrator;

pub use commands::prettier_command;
pub use orchestrator::{build_chain, run_pipeline, run_prettier};
