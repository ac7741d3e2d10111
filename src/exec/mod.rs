//! Command execution for rule batches.
//!
//! - [`CommandLine`] / [`Step`]: plain-data description of one OS command and
//!   the guard that makes it idempotent
//! - [`CommandRunner`]: the seam to the operating system
//! - [`CommandExecutor`]: runs batches sequentially, abort-on-error for setup
//!   and attempt-everything for cleanup

pub mod command;
pub mod error;
pub mod executor;
pub mod runner;

pub use command::{CommandLine, Guard, Probe, Step};
pub use error::ExecError;
pub use executor::{BatchReport, CommandExecutor, FailurePolicy, StepFailure, StepResult, StepStatus};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
