//! Engine configuration handed over by the configuration generator.
//!
//! The generator materializes the engine's config file and allocates its
//! listening ports; this crate only consumes the result. An [`EngineConfig`]
//! is immutable: a different config means a different engine process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ports the engine binds on the loopback interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSet {
    /// Transparent inbound (redirect / tproxy target).
    pub transparent: Option<u16>,
    /// HTTP proxy inbound.
    pub http: Option<u16>,
    /// SOCKS proxy inbound.
    pub socks: Option<u16>,
}

impl PortSet {
    /// Port set with only a transparent inbound.
    pub fn transparent(port: u16) -> Self {
        Self {
            transparent: Some(port),
            ..Default::default()
        }
    }

    /// Every distinct port the engine listens on, ascending.
    pub fn listening(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = [self.transparent, self.http, self.socks]
            .into_iter()
            .flatten()
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Whether no port is configured.
    pub fn is_empty(&self) -> bool {
        self.transparent.is_none() && self.http.is_none() && self.socks.is_none()
    }
}

/// A materialized engine configuration plus the ports the engine will bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    path: PathBuf,
    ports: PortSet,
}

impl EngineConfig {
    /// Wrap a config file written by the configuration generator.
    pub fn new(path: impl Into<PathBuf>, ports: PortSet) -> Self {
        Self {
            path: path.into(),
            ports,
        }
    }

    /// Path of the materialized config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ports the engine will bind.
    pub fn ports(&self) -> &PortSet {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listening_sorted_and_deduplicated() {
        let ports = PortSet {
            transparent: Some(52345),
            http: Some(20171),
            socks: Some(20171),
        };
        assert_eq!(ports.listening(), vec![20171, 52345]);
        assert!(!ports.is_empty());
    }

    #[test]
    fn test_empty_port_set() {
        let ports = PortSet::default();
        assert!(ports.is_empty());
        assert!(ports.listening().is_empty());
    }

    #[test]
    fn test_config_equality_includes_ports() {
        let a = EngineConfig::new("/run/engine/config.json", PortSet::transparent(52345));
        let b = EngineConfig::new("/run/engine/config.json", PortSet::transparent(52346));
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_eq!(a.path(), Path::new("/run/engine/config.json"));
    }
}
