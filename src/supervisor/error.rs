//! Error types for the engine process supervisor.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::state::SupervisorState;

/// Errors from starting or stopping the engine.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The engine binary could not be launched.
    #[error("Failed to launch engine '{}': {source}", binary.display())]
    Spawn {
        /// Binary that was executed.
        binary: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The engine exited before it became ready.
    #[error("Engine exited before becoming ready ({status}): {}", or_none(diagnostic))]
    ExitedBeforeReady {
        /// How the process ended.
        status: String,
        /// Captured engine output.
        diagnostic: String,
    },

    /// The engine did not become ready in time and was killed.
    #[error("Engine not ready after {timeout:?}: {}", or_none(diagnostic))]
    ReadinessTimeout {
        /// Startup timeout that elapsed.
        timeout: Duration,
        /// Captured engine output.
        diagnostic: String,
    },

    /// A stop request ended the engine while it was starting.
    #[error("Engine start cancelled by a stop request")]
    StartCancelled,

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} engine while {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: SupervisorState,
    },
}

fn or_none(diagnostic: &str) -> &str {
    if diagnostic.trim().is_empty() {
        "no output captured"
    } else {
        diagnostic
    }
}

impl SupervisorError {
    /// Captured engine output, if the error carries any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            SupervisorError::ExitedBeforeReady { diagnostic, .. }
            | SupervisorError::ReadinessTimeout { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}
