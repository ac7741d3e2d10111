//! Error types for rule building, application and cleanup.

use thiserror::Error;

use super::mode::{Platform, TransparentMode};
use crate::exec::StepFailure;

/// Errors from the rule engine.
#[derive(Debug, Error)]
pub enum RuleError {
    /// No backend implements this mode on this platform.
    #[error("Transparent mode '{mode}' is not supported on {platform}")]
    PlatformUnsupported {
        /// Requested mode.
        mode: TransparentMode,
        /// Detected platform.
        platform: Platform,
    },

    /// The engine does not listen on a port the mode needs.
    #[error("Transparent mode '{mode}' needs a {port} port but the engine has none")]
    MissingPort {
        /// Requested mode.
        mode: TransparentMode,
        /// Which listener is missing.
        port: &'static str,
    },

    /// Reading host state needed to build the batch failed.
    #[error("Failed to inspect host state with `{command}`: {reason}")]
    Probe {
        /// Rendered query.
        command: String,
        /// Why it failed.
        reason: String,
    },

    /// A setup step failed; steps before it are applied.
    #[error("Failed to apply {mode} rules at step '{step}' (`{command}`): {diagnostic}")]
    Apply {
        /// Mode whose batch failed.
        mode: TransparentMode,
        /// Description of the failing step.
        step: String,
        /// Rendered failing command.
        command: String,
        /// Captured diagnostic output.
        diagnostic: String,
        /// Commands that completed before the failure.
        completed: Vec<String>,
    },

    /// One or more cleanup steps failed; host state is uncertain.
    #[error("{} cleanup step(s) failed for {mode} rules; first: {}", failures.len(), describe_first(failures))]
    Cleanup {
        /// Mode whose cleanup failed.
        mode: TransparentMode,
        /// Every failed step.
        failures: Vec<StepFailure>,
    },
}

fn describe_first(failures: &[StepFailure]) -> String {
    match failures.first() {
        Some(f) => format!("'{}' (`{}`): {}", f.description, f.command, f.diagnostic),
        None => "none".to_string(),
    }
}

/// Result alias for rule operations.
pub type RuleResult<T> = Result<T, RuleError>;
