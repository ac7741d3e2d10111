//! Tun mode: a tun interface carrying the default route.
//!
//! Replacing the default route can leave the host with no route at all, so
//! the route in place before setup is captured in [`Tun::prepare`] and cleanup
//! restores exactly that value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::RuleBackend;
use super::error::{RuleError, RuleResult};
use super::settings::RuleSettings;
use crate::exec::{CommandExecutor, CommandLine, Probe, Step};

const IP: &str = "ip";

/// Route flags printed by `ip route show` that `ip route replace` rejects.
const DISPLAY_ONLY_FLAGS: [&str; 5] = ["linkdown", "dead", "offload", "trap", "rt_offload"];

/// Tun-mode backend for Linux iproute2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tun {
    device: String,
    /// Default route found before setup, as `ip route` tokens.
    previous_default: Option<Vec<String>>,
}

impl Tun {
    /// Route through `settings.tun_device`.
    pub fn new(settings: &RuleSettings) -> Self {
        Self {
            device: settings.tun_device.clone(),
            previous_default: None,
        }
    }

    /// Interface name.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Captured default route, if any.
    pub fn previous_default(&self) -> Option<&[String]> {
        self.previous_default.as_deref()
    }

    fn ip(&self, parts: &[&str]) -> CommandLine {
        CommandLine::new(IP, parts.iter().copied())
    }

    fn link_exists(&self) -> Probe {
        Probe::succeeds(self.ip(&["link", "show", "dev", &self.device]))
    }

    fn default_route_on_device(&self) -> Probe {
        Probe::output_contains(
            self.ip(&["route", "show", "default"]),
            format!("dev {}", self.device),
        )
    }

    /// First default route in `listing` that does not go through `device`.
    fn capture_default(listing: &str, device: &str) -> Option<Vec<String>> {
        listing
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .filter(|tokens| tokens.first() == Some(&"default"))
            .find(|tokens| !tokens.windows(2).any(|w| w[0] == "dev" && w[1] == device))
            .map(|tokens| {
                tokens
                    .into_iter()
                    .filter(|t| !DISPLAY_ONLY_FLAGS.contains(t))
                    .map(str::to_string)
                    .collect()
            })
    }
}

#[async_trait]
impl RuleBackend for Tun {
    async fn prepare(&mut self, executor: &CommandExecutor) -> RuleResult<()> {
        let query = self.ip(&["route", "show", "default"]);
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

        self.previous_default = Self::capture_default(&output.stdout, &self.device);
        match &self.previous_default {
            Some(route) => debug!("Captured default route: {}", route.join(" ")),
            None => warn!(
                "No default route outside {} found; cleanup will not restore one",
                self.device
            ),
        }
        Ok(())
    }

    fn build_setup(&self) -> Vec<Step> {
        let dev = self.device.as_str();
        vec![
            Step::new(
                format!("create tun device {}", dev),
                self.ip(&["tuntap", "add", "dev", dev, "mode", "tun"]),
            )
            .unless_present(self.link_exists()),
            Step::new(
                format!("bring {} up", dev),
                self.ip(&["link", "set", "dev", dev, "up"]),
            ),
            Step::new(
                format!("route default via {}", dev),
                self.ip(&["route", "replace", "default", "dev", dev]),
            ),
        ]
    }

    fn build_cleanup(&self) -> Vec<Step> {
        let dev = self.device.as_str();
        let mut steps = vec![
            Step::new(
                format!("remove default route via {}", dev),
                self.ip(&["route", "del", "default", "dev", dev]),
            )
            .when_present(self.default_route_on_device()),
        ];
        if let Some(route) = &self.previous_default {
            let mut args = vec!["route".to_string(), "replace".to_string()];
            args.extend(route.iter().cloned());
            steps.push(Step::new(
                "restore previous default route",
                CommandLine::new(IP, args),
            ));
        }
        steps.push(
            Step::new(
                format!("bring {} down", dev),
                self.ip(&["link", "set", "dev", dev, "down"]),
            )
            .when_present(self.link_exists()),
        );
        steps.push(
            Step::new(
                format!("delete tun device {}", dev),
                self.ip(&["tuntap", "del", "dev", dev, "mode", "tun"]),
            )
            .when_present(self.link_exists()),
        );
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_skips_tun_route_and_flags() {
        let listing = "default dev tp0 scope link\n\
                       default via 192.168.1.1 dev eth0 proto dhcp metric 100 linkdown\n\
                       default via 10.0.0.1 dev wlan0 metric 600\n";
        let route = Tun::capture_default(listing, "tp0").unwrap();
        assert_eq!(
            route.join(" "),
            "default via 192.168.1.1 dev eth0 proto dhcp metric 100"
        );
    }

    #[test]
    fn test_capture_empty_listing() {
        assert_eq!(Tun::capture_default("", "tp0"), None);
        assert_eq!(Tun::capture_default("default dev tp0 scope link\n", "tp0"), None);
    }

    #[test]
    fn test_capture_matches_device_exactly() {
        let route = Tun::capture_default("default dev tp01 scope link\n", "tp0").unwrap();
        assert_eq!(route.join(" "), "default dev tp01 scope link");
    }

    #[test]
    fn test_setup_has_three_steps() {
        let tun = Tun::new(&RuleSettings::default());
        let setup: Vec<String> = tun.build_setup().iter().map(|s| s.command.to_string()).collect();
        assert_eq!(
            setup,
            vec![
                "ip tuntap add dev tp0 mode tun",
                "ip link set dev tp0 up",
                "ip route replace default dev tp0",
            ]
        );
    }

    #[test]
    fn test_cleanup_restores_captured_route() {
        let mut tun = Tun::new(&RuleSettings::default());
        let without: Vec<String> = tun.build_cleanup().iter().map(|s| s.command.to_string()).collect();
        assert_eq!(without.len(), 3);

        tun.previous_default = Some(
            "default via 192.168.1.1 dev eth0"
                .split(' ')
                .map(str::to_string)
                .collect(),
        );
        let with: Vec<String> = tun.build_cleanup().iter().map(|s| s.command.to_string()).collect();
        assert_eq!(with.len(), 4);
        assert_eq!(with[0], "ip route del default dev tp0");
        assert_eq!(with[1], "ip route replace default via 192.168.1.1 dev eth0");
        assert_eq!(with[3], "ip tuntap del dev tp0 mode tun");
    }
}
