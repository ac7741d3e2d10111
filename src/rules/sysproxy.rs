//! System proxy mode: per-service proxy settings through `networksetup`.
//!
//! Services come and go between setup and cleanup (Wi-Fi joins, a dock is
//! unplugged), so cleanup is rebuilt from a fresh enumeration and a service
//! that no longer exists counts as cleaned.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::RuleBackend;
use super::error::{RuleError, RuleResult};
use super::settings::RuleSettings;
use crate::engine::PortSet;
use crate::exec::{CommandExecutor, CommandLine, Step};

const NETWORKSETUP: &str = "networksetup";

/// Output fragment printed when a service has disappeared.
pub const UNKNOWN_SERVICE: &str = "is not a recognized network service";

/// One class of proxied traffic and its `networksetup` verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    Web,
    SecureWeb,
    Socks,
}

impl ProxyKind {
    fn set_verb(self) -> &'static str {
        match self {
            ProxyKind::Web => "-setwebproxy",
            ProxyKind::SecureWeb => "-setsecurewebproxy",
            ProxyKind::Socks => "-setsocksfirewallproxy",
        }
    }

    fn state_verb(self) -> &'static str {
        match self {
            ProxyKind::Web => "-setwebproxystate",
            ProxyKind::SecureWeb => "-setsecurewebproxystate",
            ProxyKind::Socks => "-setsocksfirewallproxystate",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ProxyKind::Web => "web proxy",
            ProxyKind::SecureWeb => "secure web proxy",
            ProxyKind::Socks => "SOCKS proxy",
        }
    }
}

/// System-proxy backend for macOS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProxy {
    host: String,
    http: Option<u16>,
    socks: Option<u16>,
    /// Services found by the last enumeration.
    services: Vec<String>,
}

impl SystemProxy {
    /// Point services at the engine's HTTP and SOCKS listeners.
    pub fn new(settings: &RuleSettings, ports: &PortSet) -> Self {
        Self {
            host: settings.proxy_host.clone(),
            http: ports.http,
            socks: ports.socks,
            services: Vec::new(),
        }
    }

    /// Services the batches address.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    fn kinds(&self) -> Vec<(ProxyKind, u16)> {
        let mut kinds = Vec::new();
        if let Some(port) = self.http {
            kinds.push((ProxyKind::Web, port));
            kinds.push((ProxyKind::SecureWeb, port));
        }
        if let Some(port) = self.socks {
            kinds.push((ProxyKind::Socks, port));
        }
        kinds
    }

    /// Enabled services in `networksetup -listallnetworkservices` output.
    ///
    /// The first line is the legend about disabled services.
    fn parse_services(listing: &str) -> Vec<String> {
        let mut lines = listing.lines();
        if let Some(first) = lines.clone().next()
            && first.trim_start().starts_with("An asterisk")
        {
            lines.next();
        }
        lines
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| !line.starts_with('*'))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl RuleBackend for SystemProxy {
    async fn prepare(&mut self, executor: &CommandExecutor) -> RuleResult<()> {
        let query = CommandLine::new(NETWORKSETUP, ["-listallnetworkservices"]);
        let output = executor.query(&query).await.map_err(|e| RuleError::Probe {
            command: query.to_string(),
            reason: e.to_string(),
        })?;
        if !output.success() {
            return Err(RuleError::Probe {
                command: query.to_string(),
                reason: output.diagnostic(),
            });
        }
        self.services = Self::parse_services(&output.stdout);
        debug!("Enumerated network services: {:?}", self.services);
        Ok(())
    }

    fn build_setup(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        for service in &self.services {
            for (kind, port) in self.kinds() {
                steps.push(Step::new(
                    format!("set {} on {}", kind.label(), service),
                    CommandLine::new(
                        NETWORKSETUP,
                        [
                            kind.set_verb().to_string(),
                            service.clone(),
                            self.host.clone(),
                            port.to_string(),
                        ],
                    ),
                ));
            }
        }
        steps
    }

    fn build_cleanup(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        for service in &self.services {
            for (kind, _) in self.kinds() {
                steps.push(
                    Step::new(
                        format!("clear {} on {}", kind.label(), service),
                        CommandLine::new(
                            NETWORKSETUP,
                            [kind.state_verb(), service.as_str(), "off"],
                        ),
                    )
                    .tolerate(UNKNOWN_SERVICE),
                );
            }
        }
        steps
    }

    fn reenumerates_for_cleanup(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "An asterisk (*) denotes that a network service is disabled.\n\
                           Wi-Fi\n\
                           *Bluetooth PAN\n\
                           USB 10/100/1000 LAN\n";

    fn backend(http: Option<u16>, socks: Option<u16>) -> SystemProxy {
        let mut proxy = SystemProxy::new(
            &RuleSettings::default(),
            &PortSet {
                transparent: None,
                http,
                socks,
            },
        );
        proxy.services = SystemProxy::parse_services(LISTING);
        proxy
    }

    #[test]
    fn test_parse_services_skips_header_and_disabled() {
        assert_eq!(
            SystemProxy::parse_services(LISTING),
            vec!["Wi-Fi", "USB 10/100/1000 LAN"]
        );
    }

    #[test]
    fn test_parse_services_keeps_names_mentioning_asterisk() {
        let listing = "An asterisk (*) denotes that a network service is disabled.\n\
                       Asterisk VPN\n\
                       Office asterisk bridge\n";
        assert_eq!(
            SystemProxy::parse_services(listing),
            vec!["Asterisk VPN", "Office asterisk bridge"]
        );
        assert_eq!(SystemProxy::parse_services("Wi-Fi\n"), vec!["Wi-Fi"]);
    }

    #[test]
    fn test_setup_per_service_and_class() {
        let setup: Vec<String> = backend(Some(8080), Some(1080))
            .build_setup()
            .iter()
            .map(|s| s.command.to_string())
            .collect();

        assert_eq!(setup.len(), 6);
        assert_eq!(setup[0], "networksetup -setwebproxy Wi-Fi 127.0.0.1 8080");
        assert_eq!(setup[1], "networksetup -setsecurewebproxy Wi-Fi 127.0.0.1 8080");
        assert_eq!(setup[2], "networksetup -setsocksfirewallproxy Wi-Fi 127.0.0.1 1080");
        assert_eq!(
            setup[3],
            "networksetup -setwebproxy 'USB 10/100/1000 LAN' 127.0.0.1 8080"
        );
    }

    #[test]
    fn test_socks_only() {
        let setup = backend(None, Some(1080)).build_setup();
        assert_eq!(setup.len(), 2);
        assert!(setup.iter().all(|s| s.command.args[0] == "-setsocksfirewallproxy"));
    }

    #[test]
    fn test_cleanup_tolerates_vanished_service() {
        let cleanup = backend(Some(8080), None).build_cleanup();
        assert_eq!(cleanup.len(), 4);
        assert_eq!(
            cleanup[0].command.to_string(),
            "networksetup -setwebproxystate Wi-Fi off"
        );
        assert!(cleanup.iter().all(|s| s.tolerated == vec![UNKNOWN_SERVICE.to_string()]));
    }
}
