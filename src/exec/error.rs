//! Error types for command execution.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while running a single OS command.
///
/// A command that runs to completion with a non-zero exit status is *not*
/// an `ExecError`; it is reported through [`super::CommandOutput`] so the
/// batch runner can decide whether the failure is tolerated.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started (missing binary, permissions).
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish within its timeout and was killed.
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout {
        /// Rendered command line.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

impl ExecError {
    /// Rendered command line of the command that failed.
    pub fn command(&self) -> &str {
        match self {
            ExecError::Spawn { command, .. } | ExecError::Timeout { command, .. } => command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = ExecError::Spawn {
            command: "iptables -w -t nat -N TP_RULE".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("iptables -w -t nat -N TP_RULE"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_timeout_error_command() {
        let err = ExecError::Timeout {
            command: "ip route show default".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.command(), "ip route show default");
        assert!(err.to_string().contains("5s"));
    }
}
