//! Step builders for netfilter tables.
//!
//! Every mutation is paired with a probe so setup is check-before-create and
//! cleanup is check-before-delete: `-N` is guarded by `-L`, `-A` and `-D` by
//! `-C`, `-X` by `-L`.

use crate::exec::{CommandLine, Probe, Step};

/// Builds `iptables` commands against one table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Iptables<'a> {
    binary: &'a str,
    wait: bool,
    table: &'a str,
}

impl<'a> Iptables<'a> {
    pub(crate) fn new(binary: &'a str, wait: bool, table: &'a str) -> Self {
        Self {
            binary,
            wait,
            table,
        }
    }

    pub(crate) fn command<I, S>(&self, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full: Vec<String> = Vec::new();
        if self.wait {
            full.push("-w".to_string());
        }
        full.push("-t".to_string());
        full.push(self.table.to_string());
        full.extend(args.into_iter().map(Into::into));
        CommandLine::new(self.binary, full)
    }

    fn with_rule(&self, op: &str, chain: &str, rule: &[String]) -> CommandLine {
        let mut args = vec![op.to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        self.command(args)
    }

    fn chain_exists(&self, chain: &str) -> Probe {
        Probe::succeeds(self.command(["-n", "-L", chain]))
    }

    fn rule_exists(&self, chain: &str, rule: &[String]) -> Probe {
        Probe::succeeds(self.with_rule("-C", chain, rule))
    }

    pub(crate) fn create_chain(&self, chain: &str) -> Step {
        Step::new(
            format!("create chain {}", chain),
            self.command(["-N", chain]),
        )
        .unless_present(self.chain_exists(chain))
    }

    pub(crate) fn delete_chain(&self, chain: &str) -> Step {
        Step::new(
            format!("delete chain {}", chain),
            self.command(["-X", chain]),
        )
        .when_present(self.chain_exists(chain))
    }

    pub(crate) fn append(&self, description: impl Into<String>, chain: &str, rule: &[String]) -> Step {
        Step::new(description, self.with_rule("-A", chain, rule))
            .unless_present(self.rule_exists(chain, rule))
    }

    pub(crate) fn delete(&self, description: impl Into<String>, chain: &str, rule: &[String]) -> Step {
        Step::new(description, self.with_rule("-D", chain, rule))
            .when_present(self.rule_exists(chain, rule))
    }
}

/// `["-j", chain]`: a jump into a dedicated chain.
pub(crate) fn jump(chain: &str) -> Vec<String> {
    vec!["-j".to_string(), chain.to_string()]
}

/// Owned argument list from string slices.
pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Guard;

    #[test]
    fn test_command_prefix() {
        let ipt = Iptables::new("iptables", true, "nat");
        assert_eq!(
            ipt.command(["-N", "TP_RULE"]).to_string(),
            "iptables -w -t nat -N TP_RULE"
        );

        let ipt = Iptables::new("/usr/sbin/iptables-legacy", false, "mangle");
        assert_eq!(
            ipt.command(["-X", "TP_MARK"]).to_string(),
            "/usr/sbin/iptables-legacy -t mangle -X TP_MARK"
        );
    }

    #[test]
    fn test_append_is_guarded_by_check() {
        let ipt = Iptables::new("iptables", true, "nat");
        let step = ipt.append("splice", "OUTPUT", &jump("TP_RULE"));

        assert_eq!(step.command.to_string(), "iptables -w -t nat -A OUTPUT -j TP_RULE");
        match step.guard {
            Some(Guard::SkipWhenPresent(probe)) => {
                assert_eq!(
                    probe.command.to_string(),
                    "iptables -w -t nat -C OUTPUT -j TP_RULE"
                );
            }
            other => panic!("unexpected guard: {:?}", other),
        }
    }

    #[test]
    fn test_delete_chain_runs_only_when_present() {
        let ipt = Iptables::new("iptables", true, "nat");
        let step = ipt.delete_chain("TP_RULE");
        assert!(matches!(step.guard, Some(Guard::RunWhenPresent(_))));
        assert_eq!(step.description, "delete chain TP_RULE");
    }
}
