//! Tunables shared by the rule backends.

use std::time::Duration;

/// Default name of the dedicated redirect / tproxy chain.
pub const DEFAULT_CHAIN: &str = "TP_RULE";

/// Default name of the tproxy output-marking chain.
pub const DEFAULT_MARK_CHAIN: &str = "TP_MARK";

/// Default tun interface name.
pub const DEFAULT_TUN_DEVICE: &str = "tp0";

/// Linux limit on interface name length.
pub const MAX_INTERFACE_NAME: usize = 15;

/// Settings for building rule batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSettings {
    /// `iptables` binary.
    pub iptables: String,
    /// Pass `-w` so concurrent xtables users wait instead of failing.
    pub wait_for_lock: bool,
    /// Dedicated redirect / tproxy chain.
    pub chain: String,
    /// TProxy output-marking chain.
    pub mark_chain: String,
    /// Firewall mark (`value/mask`) that selects the tproxy routing table.
    pub tproxy_mark: String,
    /// Mark (`value/mask`) carried by the engine's own sockets; never intercepted.
    pub bypass_mark: String,
    /// Policy routing table for tproxy.
    pub route_table: u32,
    /// Also redirect UDP in redirect mode.
    pub redirect_udp: bool,
    /// Tun interface name.
    pub tun_device: String,
    /// Address the engine listens on, used by system proxy settings.
    pub proxy_host: String,
    /// Per-command timeout.
    pub command_timeout: Duration,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            wait_for_lock: true,
            chain: DEFAULT_CHAIN.to_string(),
            mark_chain: DEFAULT_MARK_CHAIN.to_string(),
            tproxy_mark: "0x40/0xc0".to_string(),
            bypass_mark: "0x80/0x80".to_string(),
            route_table: 100,
            redirect_udp: false,
            tun_device: DEFAULT_TUN_DEVICE.to_string(),
            proxy_host: "127.0.0.1".to_string(),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Whether `mark` looks like `0xVALUE/0xMASK`.
pub fn is_valid_mark(mark: &str) -> bool {
    let Some((value, mask)) = mark.split_once('/') else {
        return false;
    };
    [value, mask].iter().all(|part| {
        part.strip_prefix("0x")
            .is_some_and(|hex| !hex.is_empty() && u32::from_str_radix(hex, 16).is_ok())
    })
}
