//! Supervisor state machine.
//!
//! ```text
//! Stopped   --start()-->            Starting
//! Starting  --ready-->              Running
//! Starting  --timeout / exit-->     Failed
//! Running   --stop()-->             Stopping
//! Running   --unexpected exit-->    Failed
//! Stopping  --exited-->             Stopped
//! Failed    --stop() / start()-->   Stopped / Starting
//! ```

use serde::Serialize;
use std::fmt;

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No process.
    #[default]
    Stopped,
    /// Process launched, waiting for readiness.
    Starting,
    /// Process ready.
    Running,
    /// Termination requested, waiting for exit.
    Stopping,
    /// Process failed to start or exited on its own.
    Failed,
}

impl SupervisorState {
    /// Whether a process handle exists in this state.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping
        )
    }

    /// Whether `start` is allowed from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Failed => "failed",
        })
    }
}
