//! A job orchestrator that fans shell pipelines out across SLURM clusters.
//!
//! Given a pipeline description (a script, per-task inputs, output patterns,
//! resource requests, and an execution backend), canine prepares a shared
//! staging area, materializes per-task working directories with their
//! inputs, submits a single SLURM array job, polls accounting for
//! completion, and harvests declared outputs back to the invoking host.

pub mod adapter;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod localization;
pub mod orchestrator;
pub(crate) mod utils;

pub use error::Error;
pub use error::Result;

/// The canine version, exported into every task environment as `$CANINE`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entry point for the `canine` binary.
pub async fn canine_main() -> std::process::ExitCode {
    cli::main().await
}
