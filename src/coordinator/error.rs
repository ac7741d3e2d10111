//! Error types surfaced to the control plane.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::rules::RuleError;
use crate::supervisor::SupervisorError;

/// Stable error kinds for the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Binary missing, config rejected, or engine exited before ready.
    ProcessStart,
    /// Engine never became ready.
    ProcessTimeout,
    /// Engine exited while rules pointed at it.
    ProcessExitedUnexpectedly,
    /// A setup command failed.
    RuleApply,
    /// A cleanup command failed; host state is uncertain.
    RuleCleanup,
    /// No rule backend for this mode on this platform.
    PlatformUnsupported,
    /// Another state change is in progress.
    Busy,
    /// Operation not valid in the supervisor's current state.
    InvalidState,
    /// The engine config lacks a port the mode needs.
    InvalidPorts,
    /// The applied-rules journal could not be read or written.
    Journal,
}

impl ErrorKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProcessStart => "process_start",
            ErrorKind::ProcessTimeout => "process_timeout",
            ErrorKind::ProcessExitedUnexpectedly => "process_exited_unexpectedly",
            ErrorKind::RuleApply => "rule_apply",
            ErrorKind::RuleCleanup => "rule_cleanup",
            ErrorKind::PlatformUnsupported => "platform_unsupported",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidPorts => "invalid_ports",
            ErrorKind::Journal => "journal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`Coordinator`](super::Coordinator) operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Starting or stopping the engine failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Building, applying or cleaning rules failed.
    #[error(transparent)]
    Rules(#[from] RuleError),

    /// The engine died while its rules were being applied.
    #[error("Engine pid {pid} {status} while rules were being applied")]
    EngineExited {
        /// Pid of the engine that exited.
        pid: u32,
        /// How it ended.
        status: String,
        /// Captured engine output.
        diagnostic: String,
    },

    /// Another `set_desired_state` call holds the lock.
    #[error("Another state change is in progress (waited {waited:?})")]
    Busy {
        /// How long this call waited.
        waited: Duration,
    },

    /// Reading or writing the journal failed.
    #[error("Failed to {action} applied-rules journal '{}': {source}", path.display())]
    Journal {
        /// What was being done.
        action: &'static str,
        /// Journal path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The journal exists but does not hold a batch.
    #[error("Applied-rules journal '{}' is corrupt: {source}", path.display())]
    JournalCorrupt {
        /// Journal path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl CoordinatorError {
    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Supervisor(e) => match e {
                SupervisorError::Spawn { .. }
                | SupervisorError::ExitedBeforeReady { .. }
                | SupervisorError::StartCancelled => {
                    ErrorKind::ProcessStart
                }
                SupervisorError::ReadinessTimeout { .. } => ErrorKind::ProcessTimeout,
                SupervisorError::InvalidState { .. } => ErrorKind::InvalidState,
            },
            CoordinatorError::Rules(e) => match e {
                RuleError::PlatformUnsupported { .. } => ErrorKind::PlatformUnsupported,
                RuleError::MissingPort { .. } => ErrorKind::InvalidPorts,
                RuleError::Probe { .. } | RuleError::Apply { .. } => ErrorKind::RuleApply,
                RuleError::Cleanup { .. } => ErrorKind::RuleCleanup,
            },
            CoordinatorError::EngineExited { .. } => ErrorKind::ProcessExitedUnexpectedly,
            CoordinatorError::Busy { .. } => ErrorKind::Busy,
            CoordinatorError::Journal { .. } | CoordinatorError::JournalCorrupt { .. } => {
                ErrorKind::Journal
            }
        }
    }

    /// Free-text diagnostic for the end user.
    ///
    /// The message plus any captured engine or command output.
    pub fn diagnostic(&self) -> String {
        match self {
            CoordinatorError::EngineExited { diagnostic, .. } if !diagnostic.trim().is_empty() => {
                format!("{}\n{}", self, diagnostic)
            }
            _ => self.to_string(),
        }
    }
}

/// Result alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::TransparentMode;

    #[test]
    fn test_supervisor_kinds() {
        let timeout: CoordinatorError = SupervisorError::ReadinessTimeout {
            timeout: Duration::from_secs(10),
            diagnostic: String::new(),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::ProcessTimeout);

        let early: CoordinatorError = SupervisorError::ExitedBeforeReady {
            status: "exited with status 23".to_string(),
            diagnostic: "failed to parse config".to_string(),
        }
        .into();
        assert_eq!(early.kind(), ErrorKind::ProcessStart);
        assert!(early.diagnostic().contains("failed to parse config"));
    }

    #[test]
    fn test_rule_kinds() {
        let unsupported: CoordinatorError = RuleError::PlatformUnsupported {
            mode: TransparentMode::Tun,
            platform: crate::rules::Platform::MacOs,
        }
        .into();
        assert_eq!(unsupported.kind(), ErrorKind::PlatformUnsupported);

        let ports: CoordinatorError = RuleError::MissingPort {
            mode: TransparentMode::Redirect,
            port: "transparent",
        }
        .into();
        assert_eq!(ports.kind(), ErrorKind::InvalidPorts);
    }

    #[test]
    fn test_engine_exited_diagnostic() {
        let err = CoordinatorError::EngineExited {
            pid: 77,
            status: "killed by SIGSEGV".to_string(),
            diagnostic: "panic: runtime error".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ProcessExitedUnexpectedly);
        assert!(err.diagnostic().starts_with("Engine pid 77 killed by SIGSEGV"));
        assert!(err.diagnostic().ends_with("panic: runtime error"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Busy.to_string(), "busy");
        assert_eq!(
            serde_json::to_string(&ErrorKind::ProcessExitedUnexpectedly).unwrap(),
            "\"process_exited_unexpectedly\""
        );
    }
}
