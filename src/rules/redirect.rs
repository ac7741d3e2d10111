//! Redirect mode: a dedicated `nat` chain spliced into `OUTPUT`.
//!
//! ```text
//! setup:   -N TP_RULE  →  -A TP_RULE ... -j REDIRECT --to-ports P  →  -A OUTPUT -j TP_RULE
//! cleanup: -D OUTPUT -j TP_RULE  →  -D TP_RULE ...  →  -X TP_RULE
//! ```
//!
//! Cleanup runs in exact reverse so a partial cleanup never leaves `OUTPUT`
//! jumping into a chain that no longer exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::backend::RuleBackend;
use super::iptables::{args, jump, Iptables};
use super::settings::RuleSettings;
use crate::exec::Step;

const TABLE: &str = "nat";
const OUTBOUND_CHAIN: &str = "OUTPUT";

/// Redirect-mode backend for Linux netfilter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    iptables: String,
    wait_for_lock: bool,
    chain: String,
    bypass_mark: String,
    port: u16,
    udp: bool,
}

impl Redirect {
    /// Redirect outbound traffic to `port`.
    pub fn new(settings: &RuleSettings, port: u16) -> Self {
        Self {
            iptables: settings.iptables.clone(),
            wait_for_lock: settings.wait_for_lock,
            chain: settings.chain.clone(),
            bypass_mark: settings.bypass_mark.clone(),
            port,
            udp: settings.redirect_udp,
        }
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn ipt(&self) -> Iptables<'_> {
        Iptables::new(&self.iptables, self.wait_for_lock, TABLE)
    }

    fn protocols(&self) -> Vec<&'static str> {
        if self.udp { vec!["tcp", "udp"] } else { vec!["tcp"] }
    }

    fn redirect_rule(&self, protocol: &str) -> Vec<String> {
        let port = self.port.to_string();
        args(&[
            "-p",
            protocol,
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
            "REDIRECT",
            "--to-ports",
            &port,
        ])
    }
}

#[async_trait]
impl RuleBackend for Redirect {
    fn build_setup(&self) -> Vec<Step> {
        let ipt = self.ipt();
        let mut steps = vec![ipt.create_chain(&self.chain)];
        for protocol in self.protocols() {
            steps.push(ipt.append(
                format!(
                    "redirect {} to port {}",
                    protocol.to_ascii_uppercase(),
                    self.port
                ),
                &self.chain,
                &self.redirect_rule(protocol),
            ));
        }
        steps.push(ipt.append(
            format!("splice {} into {}", self.chain, OUTBOUND_CHAIN),
            OUTBOUND_CHAIN,
            &jump(&self.chain),
        ));
        steps
    }

    fn build_cleanup(&self) -> Vec<Step> {
        let ipt = self.ipt();
        let mut steps = vec![ipt.delete(
            format!("remove {} splice from {}", self.chain, OUTBOUND_CHAIN),
            OUTBOUND_CHAIN,
            &jump(&self.chain),
        )];
        for protocol in self.protocols().into_iter().rev() {
            steps.push(ipt.delete(
                format!("delete {} redirect rule", protocol.to_ascii_uppercase()),
                &self.chain,
                &self.redirect_rule(protocol),
            ));
        }
        steps.push(ipt.delete_chain(&self.chain));
        steps
    }
}
