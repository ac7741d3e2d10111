//! TProxy mode: `mangle` TPROXY rules plus fwmark policy routing.
//!
//! Inbound packets hitting `PREROUTING` are diverted to the engine by the
//! TPROXY target. Locally generated packets are marked in `OUTPUT`, which
//! the policy rule routes through `lo` so they re-enter `PREROUTING`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::backend::RuleBackend;
use super::iptables::{args, jump, Iptables};
use super::settings::RuleSettings;
use crate::exec::{CommandLine, Probe, Step};

const TABLE: &str = "mangle";
const IP: &str = "ip";
const PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// TProxy-mode backend for Linux netfilter and iproute2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tproxy {
    iptables: String,
    wait_for_lock: bool,
    chain: String,
    mark_chain: String,
    mark: String,
    bypass_mark: String,
    table: u32,
    port: u16,
}

impl Tproxy {
    /// Divert traffic to the engine's transparent listener on `port`.
    pub fn new(settings: &RuleSettings, port: u16) -> Self {
        Self {
            iptables: settings.iptables.clone(),
            wait_for_lock: settings.wait_for_lock,
            chain: settings.chain.clone(),
            mark_chain: settings.mark_chain.clone(),
            mark: settings.tproxy_mark.clone(),
            bypass_mark: settings.bypass_mark.clone(),
            table: settings.route_table,
            port,
        }
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn ipt(&self) -> Iptables<'_> {
        Iptables::new(&self.iptables, self.wait_for_lock, TABLE)
    }

    fn ip(&self, parts: &[&str]) -> CommandLine {
        CommandLine::new(IP, parts.iter().copied())
    }

    fn policy_rule(&self, op: &str) -> CommandLine {
        let table = self.table.to_string();
        self.ip(&["rule", op, "fwmark", &self.mark, "table", &table])
    }

    fn policy_rule_present(&self) -> Probe {
        Probe::output_contains(
            self.ip(&["rule", "show"]),
            format!("fwmark {} lookup {}", self.mark, self.table),
        )
    }

    fn local_route(&self, op: &str) -> CommandLine {
        let table = self.table.to_string();
        self.ip(&["route", op, "local", "default", "dev", "lo", "table", &table])
    }

    fn local_route_present(&self) -> Probe {
        let table = self.table.to_string();
        Probe::output_contains(
            self.ip(&["route", "show", "table", &table]),
            "local default dev lo",
        )
    }

    fn tproxy_rule(&self, protocol: &str) -> Vec<String> {
        let port = self.port.to_string();
        args(&[
            "-p",
            protocol,
            "-m",
            "addrtype",
            "!",
            "--dst-type",
            "LOCAL",
            "-j",
            "TPROXY",
            "--on-ip",
            "127.0.0.1",
            "--on-port",
            &port,
            "--tproxy-mark",
            &self.mark,
        ])
    }

    fn mark_rule(&self) -> Vec<String> {
        args(&[
            "-m",
            "addrtype",
            "!",
            "--dst-type",
            "LOCAL",
            "-m",
            "mark",
            "!",
            "--mark",
            &self.bypass_mark,
            "-j",
            "MARK",
            "--set-xmark",
            &self.mark,
        ])
    }
}

#[async_trait]
impl RuleBackend for Tproxy {
    fn build_setup(&self) -> Vec<Step> {
        let ipt = self.ipt();
        let mut steps = vec![
            Step::new(
                format!("route fwmark {} via table {}", self.mark, self.table),
                self.policy_rule("add"),
            )
            .unless_present(self.policy_rule_present()),
            Step::new(
                format!("local default route in table {}", self.table),
                self.local_route("replace"),
            ),
            ipt.create_chain(&self.chain),
        ];
        for protocol in PROTOCOLS {
            steps.push(ipt.append(
                format!(
                    "tproxy {} to port {}",
                    protocol.to_ascii_uppercase(),
                    self.port
                ),
                &self.chain,
                &self.tproxy_rule(protocol),
            ));
        }
        steps.push(ipt.create_chain(&self.mark_chain));
        steps.push(ipt.append(
            "mark outbound traffic for rerouting",
            &self.mark_chain,
            &self.mark_rule(),
        ));
        steps.push(ipt.append(
            format!("splice {} into PREROUTING", self.chain),
            "PREROUTING",
            &jump(&self.chain),
        ));
        steps.push(ipt.append(
            format!("splice {} into OUTPUT", self.mark_chain),
            "OUTPUT",
            &jump(&self.mark_chain),
        ));
        steps
    }

    fn build_cleanup(&self) -> Vec<Step> {
        let ipt = self.ipt();
        let mut steps = vec![
            ipt.delete(
                format!("remove {} splice from OUTPUT", self.mark_chain),
                "OUTPUT",
                &jump(&self.mark_chain),
            ),
            ipt.delete(
                format!("remove {} splice from PREROUTING", self.chain),
                "PREROUTING",
                &jump(&self.chain),
            ),
            Step::new(
                format!("remove fwmark {} routing rule", self.mark),
                self.policy_rule("del"),
            )
            .when_present(self.policy_rule_present()),
            Step::new(
                format!("remove local default route from table {}", self.table),
                self.local_route("del"),
            )
            .when_present(self.local_route_present()),
            ipt.delete("delete mark rule", &self.mark_chain, &self.mark_rule()),
            ipt.delete_chain(&self.mark_chain),
        ];
        for protocol in PROTOCOLS.iter().rev() {
            steps.push(ipt.delete(
                format!("delete {} tproxy rule", protocol.to_ascii_uppercase()),
                &self.chain,
                &self.tproxy_rule(protocol),
            ));
        }
        steps.push(ipt.delete_chain(&self.chain));
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Guard;

    fn backend() -> Tproxy {
        Tproxy::new(&RuleSettings::default(), 52346)
    }

    #[test]
    fn test_routing_precedes_filter_rules() {
        let setup: Vec<String> = backend()
            .build_setup()
            .iter()
            .map(|s| s.command.to_string())
            .collect();

        assert_eq!(setup[0], "ip rule add fwmark 0x40/0xc0 table 100");
        assert_eq!(setup[1], "ip route replace local default dev lo table 100");
        assert_eq!(setup[2], "iptables -w -t mangle -N TP_RULE");
        assert!(setup[3].contains("-j TPROXY --on-ip 127.0.0.1 --on-port 52346"));
        assert_eq!(setup.last().unwrap(), "iptables -w -t mangle -A OUTPUT -j TP_MARK");
    }

    #[test]
    fn test_cleanup_unsplices_then_unroutes_then_drops_chains() {
        let cleanup: Vec<String> = backend()
            .build_cleanup()
            .iter()
            .map(|s| s.command.to_string())
            .collect();

        assert_eq!(cleanup.len(), 9);
        assert_eq!(cleanup[0], "iptables -w -t mangle -D OUTPUT -j TP_MARK");
        assert_eq!(cleanup[1], "iptables -w -t mangle -D PREROUTING -j TP_RULE");
        assert_eq!(cleanup[2], "ip rule del fwmark 0x40/0xc0 table 100");
        assert_eq!(cleanup[3], "ip route del local default dev lo table 100");
        assert_eq!(cleanup[5], "iptables -w -t mangle -X TP_MARK");
        assert_eq!(cleanup[8], "iptables -w -t mangle -X TP_RULE");
    }

    #[test]
    fn test_policy_rule_guard_reads_rule_listing() {
        let setup = backend().build_setup();
        match &setup[0].guard {
            Some(Guard::SkipWhenPresent(probe)) => {
                assert_eq!(probe.command.to_string(), "ip rule show");
                assert_eq!(probe.contains.as_deref(), Some("fwmark 0x40/0xc0 lookup 100"));
            }
            other => panic!("unexpected guard: {:?}", other),
        }
    }
}
