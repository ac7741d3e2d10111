//! Configuration schema definitions.
//!
//! Every key is optional in a file; a layer only overrides the keys it
//! sets. [`Config::settings`] fills the gaps with built-in defaults and
//! validates the result.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::ConfigError;
use crate::coordinator::CoordinatorSettings;
use crate::rules::RuleSettings;
use crate::rules::settings::{MAX_INTERFACE_NAME, is_valid_mark};
use crate::supervisor::{LogLineMatch, PortsListening, ReadinessCheck, SupervisorSettings};

/// Default location of the applied-rules journal.
pub const DEFAULT_JOURNAL_PATH: &str = "/run/proxy-warden/applied.json";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Engine process settings.
    #[serde(default)]
    pub engine: EngineSection,

    /// Rule backend settings.
    #[serde(default)]
    pub rules: RulesSection,

    /// Coordinator settings.
    #[serde(default)]
    pub coordinator: CoordinatorSection,
}

impl Config {
    /// Merge another config into this one. Keys set in `other` win.
    pub fn merge(&mut self, other: Config) {
        self.engine.merge(other.engine);
        self.rules.merge(other.rules);
        self.coordinator.merge(other.coordinator);
    }

    /// Resolve defaults and validate.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let rules = self.rules.resolve()?;
        let supervisor = self.engine.resolve()?;
        let readiness = match self.engine.readiness.unwrap_or_default() {
            ReadinessKind::Ports => Readiness::Ports,
            ReadinessKind::LogLine => {
                let pattern = self.engine.ready_pattern.clone().unwrap_or_default();
                if pattern.is_empty() {
                    return Err(ConfigError::invalid(
                        "engine.ready_pattern",
                        "required when engine.readiness = \"log_line\"",
                    ));
                }
                Readiness::LogLine(pattern)
            }
        };
        let coordinator = self.coordinator.resolve();

        Ok(Settings {
            supervisor,
            readiness,
            rules,
            coordinator,
        })
    }
}

/// Readiness strategy names in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessKind {
    /// Every listening port accepts a connection.
    #[default]
    Ports,
    /// A line of engine output contains `ready_pattern`.
    LogLine,
}

/// `[engine]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Engine binary; bare names are looked up in `PATH`.
    pub binary: Option<PathBuf>,
    /// Engine arguments; `{config}` is replaced by the config path.
    pub args: Option<Vec<String>>,
    /// Readiness wait bound.
    pub startup_timeout_ms: Option<u64>,
    /// SIGTERM to SIGKILL grace period.
    pub stop_grace_ms: Option<u64>,
    /// Readiness polling interval.
    pub probe_interval_ms: Option<u64>,
    /// Readiness strategy.
    pub readiness: Option<ReadinessKind>,
    /// Pattern for `readiness = "log_line"`.
    pub ready_pattern: Option<String>,
    /// Output lines kept for diagnostics.
    pub output_lines: Option<usize>,
}

impl EngineSection {
    fn merge(&mut self, other: EngineSection) {
        override_with(&mut self.binary, other.binary);
        override_with(&mut self.args, other.args);
        override_with(&mut self.startup_timeout_ms, other.startup_timeout_ms);
        override_with(&mut self.stop_grace_ms, other.stop_grace_ms);
        override_with(&mut self.probe_interval_ms, other.probe_interval_ms);
        override_with(&mut self.readiness, other.readiness);
        override_with(&mut self.ready_pattern, other.ready_pattern);
        override_with(&mut self.output_lines, other.output_lines);
    }

    fn resolve(&self) -> Result<SupervisorSettings, ConfigError> {
        let defaults = SupervisorSettings::default();
        let binary = self.binary.clone().unwrap_or(defaults.binary);
        if binary.as_os_str().is_empty() {
            return Err(ConfigError::invalid("engine.binary", "must not be empty"));
        }

        Ok(SupervisorSettings {
            binary: resolve_binary(&binary),
            args: self.args.clone().unwrap_or(defaults.args),
            startup_timeout: required_ms(
                "engine.startup_timeout_ms",
                self.startup_timeout_ms,
                defaults.startup_timeout,
            )?,
            stop_grace: required_ms("engine.stop_grace_ms", self.stop_grace_ms, defaults.stop_grace)?,
            probe_interval: required_ms(
                "engine.probe_interval_ms",
                self.probe_interval_ms,
                defaults.probe_interval,
            )?,
            output_lines: self.output_lines.unwrap_or(defaults.output_lines),
        })
    }
}

/// `[rules]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RulesSection {
    /// `iptables` binary.
    pub iptables: Option<String>,
    /// Pass `-w` to iptables.
    pub wait_for_lock: Option<bool>,
    /// Redirect / tproxy chain.
    pub chain: Option<String>,
    /// TProxy output-marking chain.
    pub mark_chain: Option<String>,
    /// TProxy firewall mark, `0xVALUE/0xMASK`.
    pub tproxy_mark: Option<String>,
    /// Mark on the engine's own sockets, `0xVALUE/0xMASK`.
    pub bypass_mark: Option<String>,
    /// TProxy policy routing table.
    pub route_table: Option<u32>,
    /// Also redirect UDP in redirect mode.
    pub redirect_udp: Option<bool>,
    /// Tun interface name.
    pub tun_device: Option<String>,
    /// Engine listen address for system proxy settings.
    pub proxy_host: Option<String>,
    /// Per-command timeout.
    pub command_timeout_ms: Option<u64>,
}

impl RulesSection {
    fn merge(&mut self, other: RulesSection) {
        override_with(&mut self.iptables, other.iptables);
        override_with(&mut self.wait_for_lock, other.wait_for_lock);
        override_with(&mut self.chain, other.chain);
        override_with(&mut self.mark_chain, other.mark_chain);
        override_with(&mut self.tproxy_mark, other.tproxy_mark);
        override_with(&mut self.bypass_mark, other.bypass_mark);
        override_with(&mut self.route_table, other.route_table);
        override_with(&mut self.redirect_udp, other.redirect_udp);
        override_with(&mut self.tun_device, other.tun_device);
        override_with(&mut self.proxy_host, other.proxy_host);
        override_with(&mut self.command_timeout_ms, other.command_timeout_ms);
    }

    fn resolve(&self) -> Result<RuleSettings, ConfigError> {
        let d = RuleSettings::default();
        let settings = RuleSettings {
            iptables: self.iptables.clone().unwrap_or(d.iptables),
            wait_for_lock: self.wait_for_lock.unwrap_or(d.wait_for_lock),
            chain: self.chain.clone().unwrap_or(d.chain),
            mark_chain: self.mark_chain.clone().unwrap_or(d.mark_chain),
            tproxy_mark: self.tproxy_mark.clone().unwrap_or(d.tproxy_mark),
            bypass_mark: self.bypass_mark.clone().unwrap_or(d.bypass_mark),
            route_table: self.route_table.unwrap_or(d.route_table),
            redirect_udp: self.redirect_udp.unwrap_or(d.redirect_udp),
            tun_device: self.tun_device.clone().unwrap_or(d.tun_device),
            proxy_host: self.proxy_host.clone().unwrap_or(d.proxy_host),
            command_timeout: required_ms(
                "rules.command_timeout_ms",
                self.command_timeout_ms,
                d.command_timeout,
            )?,
        };

        for (field, value) in [
            ("rules.iptables", &settings.iptables),
            ("rules.chain", &settings.chain),
            ("rules.mark_chain", &settings.mark_chain),
            ("rules.proxy_host", &settings.proxy_host),
        ] {
            if value.trim().is_empty() || value.contains(char::is_whitespace) {
                return Err(ConfigError::invalid(field, "must be a non-empty word"));
            }
        }
        if settings.chain == settings.mark_chain {
            return Err(ConfigError::invalid(
                "rules.mark_chain",
                "must differ from rules.chain",
            ));
        }
        for (field, mark) in [
            ("rules.tproxy_mark", &settings.tproxy_mark),
            ("rules.bypass_mark", &settings.bypass_mark),
        ] {
            if !is_valid_mark(mark) {
                return Err(ConfigError::invalid(
                    field,
                    format!("'{}' is not of the form 0xVALUE/0xMASK", mark),
                ));
            }
        }
        let device = &settings.tun_device;
        if device.is_empty() || device.len() > MAX_INTERFACE_NAME || device.contains(['/', ' ']) {
            return Err(ConfigError::invalid(
                "rules.tun_device",
                format!(
                    "'{}' is not a valid interface name (1-{} bytes, no '/' or spaces)",
                    device, MAX_INTERFACE_NAME
                ),
            ));
        }
        if settings.route_table == 0 {
            return Err(ConfigError::invalid("rules.route_table", "must be non-zero"));
        }

        Ok(settings)
    }
}

/// `[coordinator]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    /// How long a state change waits for an in-flight one; 0 rejects.
    pub lock_timeout_ms: Option<u64>,
    /// Applied-rules journal; an empty string disables it.
    pub journal: Option<PathBuf>,
}

impl CoordinatorSection {
    fn merge(&mut self, other: CoordinatorSection) {
        override_with(&mut self.lock_timeout_ms, other.lock_timeout_ms);
        override_with(&mut self.journal, other.journal);
    }

    fn resolve(&self) -> CoordinatorSettings {
        let defaults = CoordinatorSettings::default();
        let journal = match &self.journal {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path.clone()),
            None => Some(PathBuf::from(DEFAULT_JOURNAL_PATH)),
        };
        CoordinatorSettings {
            lock_timeout: self
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            journal,
        }
    }
}

/// Readiness strategy after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Port probe.
    Ports,
    /// Output line match.
    LogLine(String),
}

/// Validated settings for every component.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Engine process.
    pub supervisor: SupervisorSettings,
    /// Readiness strategy.
    pub readiness: Readiness,
    /// Rule backends.
    pub rules: RuleSettings,
    /// Coordinator.
    pub coordinator: CoordinatorSettings,
}

impl Settings {
    /// Readiness check for the supervisor.
    pub fn readiness_check(&self) -> Arc<dyn ReadinessCheck> {
        match &self.readiness {
            Readiness::Ports => Arc::new(PortsListening::new(self.supervisor.probe_interval)),
            Readiness::LogLine(pattern) => Arc::new(LogLineMatch(pattern.clone())),
        }
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn required_ms(field: &str, value: Option<u64>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::invalid(field, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

/// Look bare binary names up in `PATH`. Paths and names that cannot be
/// found are returned unchanged; launching reports the failure.
fn resolve_binary(binary: &Path) -> PathBuf {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.to_path_buf();
    }
    match which::which(binary) {
        Ok(path) => path,
        Err(e) => {
            debug!("Engine binary {:?} not found in PATH: {}", binary, e);
            binary.to_path_buf()
        }
    }
}
