//! Configuration system for proxy-warden.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/proxy-warden/config.toml`
//! 2. User config: `~/.config/proxy-warden/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! No file is required; built-in defaults cover every key.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! binary = "xray"
//! args = ["run", "-c", "{config}"]
//! readiness = "ports"
//!
//! [rules]
//! chain = "TP_RULE"
//! redirect_udp = false
//!
//! [coordinator]
//! lock_timeout_ms = 30000
//! journal = "/run/proxy-warden/applied.json"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{
    Config, CoordinatorSection, DEFAULT_JOURNAL_PATH, EngineSection, Readiness, ReadinessKind,
    RulesSection, Settings,
};
