//! How the engine is launched and timed.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in engine arguments replaced by the config path.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Launch and timing settings for the engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Engine binary.
    pub binary: PathBuf,
    /// Arguments; [`CONFIG_PLACEHOLDER`] is replaced by the config path.
    pub args: Vec<String>,
    /// Bound on the wait for readiness.
    pub startup_timeout: Duration,
    /// Bound on the wait for exit after SIGTERM, before SIGKILL.
    pub stop_grace: Duration,
    /// Readiness polling interval.
    pub probe_interval: Duration,
    /// Engine output lines kept for diagnostics.
    pub output_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xray"),
            args: vec!["run".to_string(), "-c".to_string(), CONFIG_PLACEHOLDER.to_string()],
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
            probe_interval: Duration::from_millis(100),
            output_lines: 64,
        }
    }
}

impl SupervisorSettings {
    /// Arguments for an engine reading `config`.
    pub fn command_args(&self, config: &Path) -> Vec<String> {
        let config = config.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_placeholder_substitution() {
        let settings = SupervisorSettings::default();
        assert_eq!(
            settings.command_args(Path::new("/run/proxy-warden/config.json")),
            vec!["run", "-c", "/run/proxy-warden/config.json"]
        );

        let settings = SupervisorSettings {
            args: vec!["-config={config}".to_string(), "-format=json".to_string()],
            ..Default::default()
        };
        assert_eq!(
            settings.command_args(Path::new("/tmp/c.json")),
            vec!["-config=/tmp/c.json", "-format=json"]
        );
    }
}
