//! In-memory host for exercising rule batches without privileges.
//!
//! [`FakeHost`] implements [`CommandRunner`] and understands the subset of
//! `iptables`, `ip` and `networksetup` the rule backends issue, with the
//! same exit codes and error messages as the real tools for the cases the
//! backends care about (missing chain, rule not found, chain still
//! referenced, device down, unknown network service). State is compared
//! through [`HostSnapshot`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError};

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";
const CHAIN_EXISTS: &str = "iptables: Chain already exists.";
const TOO_MANY_LINKS: &str = "iptables: Too many links.";
const NOT_EMPTY: &str = "iptables: Directory not empty.";

const TARGETS: [&str; 11] = [
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "REDIRECT",
    "TPROXY",
    "MARK",
    "MASQUERADE",
    "DNAT",
    "SNAT",
    "LOG",
];

const MAIN_TABLE: u32 = 254;
const ROUTE_TYPES: [&str; 5] = ["unicast", "local", "blackhole", "unreachable", "prohibit"];

const SERVICES_HEADER: &str = "An asterisk (*) denotes that a network service is disabled.";

fn builtin_chains(table: &str) -> &'static [&'static str] {
    match table {
        "filter" => &["INPUT", "FORWARD", "OUTPUT"],
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        _ => &[],
    }
}

/// Identity of a route: two routes with the same key replace each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RouteKey {
    table: u32,
    kind: String,
    dest: String,
    metric: u32,
}

#[derive(Debug)]
struct ParsedRoute {
    key: RouteKey,
    spec: String,
    dev: Option<String>,
    has_metric: bool,
}

fn parse_route(tokens: &[&str]) -> Result<ParsedRoute, String> {
    let mut table = MAIN_TABLE;
    let mut metric = 0;
    let mut has_metric = false;
    let mut dev = None;
    let mut kept: Vec<&str> = Vec::new();

    let mut iter = tokens.iter().copied();
    while let Some(token) = iter.next() {
        match token {
            "table" => {
                let value = iter.next().ok_or("Error: argument \"table\" is wrong")?;
                table = match value {
                    "main" => MAIN_TABLE,
                    n => n
                        .parse()
                        .map_err(|_| format!("Error: argument \"{}\" is wrong: invalid table ID", n))?,
                };
            }
            "metric" => {
                let value = iter.next().ok_or("Error: argument \"metric\" is wrong")?;
                metric = value
                    .parse()
                    .map_err(|_| format!("Error: argument \"{}\" is wrong: \"metric\" value is invalid", value))?;
                has_metric = true;
                kept.push(token);
                kept.push(value);
            }
            "dev" => {
                let value = iter.next().ok_or("Error: argument \"dev\" is wrong")?;
                dev = Some(value.to_string());
                kept.push(token);
                kept.push(value);
            }
            other => kept.push(other),
        }
    }

    let (kind, dest) = match kept.as_slice() {
        [first, second, ..] if ROUTE_TYPES.iter().any(|t| t == first) => (*first, *second),
        [first, ..] => ("unicast", *first),
        [] => return Err("Error: destination is missing".to_string()),
    };

    Ok(ParsedRoute {
        key: RouteKey {
            table,
            kind: kind.to_string(),
            dest: dest.to_string(),
            metric,
        },
        spec: kept.join(" "),
        dev,
        has_metric,
    })
}

fn route_device(spec: &str) -> Option<&str> {
    let tokens: Vec<&str> = spec.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|w| w[0] == "dev")
        .map(|w| w[1])
}

fn jump_target(rule: &str) -> Option<&str> {
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|w| w[0] == "-j")
        .map(|w| w[1])
}

fn proxy_kind(verb: &str) -> Option<(&'static str, bool)> {
    match verb {
        "-setwebproxy" => Some(("web", false)),
        "-setsecurewebproxy" => Some(("secureweb", false)),
        "-setsocksfirewallproxy" => Some(("socks", false)),
        "-setwebproxystate" => Some(("web", true)),
        "-setsecurewebproxystate" => Some(("secureweb", true)),
        "-setsocksfirewallproxystate" => Some(("socks", true)),
        _ => None,
    }
}

/// Observable host state: packet filter, policy routing, routes, links and
/// network service proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    tables: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    policy_rules: Vec<String>,
    routes: BTreeMap<RouteKey, String>,
    links: BTreeMap<String, bool>,
    services: Vec<String>,
    proxies: BTreeMap<(String, String), String>,
}

impl Default for HostSnapshot {
    fn default() -> Self {
        let tables = ["filter", "nat", "mangle"]
            .into_iter()
            .map(|table| {
                let chains = builtin_chains(table)
                    .iter()
                    .map(|chain| (chain.to_string(), Vec::new()))
                    .collect();
                (table.to_string(), chains)
            })
            .collect();
        let mut links = BTreeMap::new();
        links.insert("lo".to_string(), true);

        Self {
            tables,
            policy_rules: Vec::new(),
            routes: BTreeMap::new(),
            links,
            services: Vec::new(),
            proxies: BTreeMap::new(),
        }
    }
}

impl HostSnapshot {
    /// Whether `chain` exists in `table`.
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|chains| chains.contains_key(chain))
    }

    /// Whether `chain` in `table` holds exactly `rule`.
    pub fn has_rule(&self, table: &str, chain: &str, rule: &str) -> bool {
        self.rules(table, chain).iter().any(|r| r == rule)
    }

    /// Rules of `chain` in `table`, in order.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Policy routing rules added on top of the built-in ones.
    pub fn policy_rules(&self) -> &[String] {
        &self.policy_rules
    }

    /// Default routes in the main table, lowest metric first.
    pub fn default_routes(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(key, _)| key.table == MAIN_TABLE && key.dest == "default" && key.kind == "unicast")
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    /// Whether interface `name` exists.
    pub fn has_link(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Configured `host:port` for `kind` (`web`, `secureweb`, `socks`) on `service`.
    pub fn proxy(&self, service: &str, kind: &str) -> Option<String> {
        self.proxies
            .get(&(service.to_string(), kind.to_string()))
            .cloned()
    }

    fn iptables(&mut self, args: &[&str]) -> CommandOutput {
        let mut table = "filter";
        let mut rest: Vec<&str> = Vec::new();
        let mut iter = args.iter().copied();
        while let Some(arg) = iter.next() {
            match arg {
                "-w" | "-n" => {}
                "-t" => match iter.next() {
                    Some(t) => table = t,
                    None => return CommandOutput::failed(2, "iptables: option \"-t\" requires an argument"),
                },
                other => rest.push(other),
            }
        }

        let Some(chains) = self.tables.get_mut(table) else {
            return CommandOutput::failed(
                3,
                format!(
                    "iptables v1.8.9 (legacy): can't initialize iptables table `{}': Table does not exist (do you need to insmod?)",
                    table
                ),
            );
        };
        let references = |chains: &BTreeMap<String, Vec<String>>, chain: &str| {
            chains
                .values()
                .flatten()
                .filter(|rule| jump_target(rule) == Some(chain))
                .count()
        };

        match rest.as_slice() {
            ["-N", chain] => {
                if chains.contains_key(*chain) {
                    return CommandOutput::failed(1, CHAIN_EXISTS);
                }
                chains.insert(chain.to_string(), Vec::new());
                CommandOutput::ok("")
            }
            ["-X", chain] => {
                if builtin_chains(table).iter().any(|b| b == chain) {
                    return CommandOutput::failed(1, "iptables: Invalid argument. Run `dmesg' for more information.");
                }
                let Some(rules) = chains.get(*chain) else {
                    return CommandOutput::failed(1, NO_CHAIN);
                };
                if !rules.is_empty() {
                    return CommandOutput::failed(1, NOT_EMPTY);
                }
                if references(chains, *chain) > 0 {
                    return CommandOutput::failed(1, TOO_MANY_LINKS);
                }
                chains.remove(*chain);
                CommandOutput::ok("")
            }
            ["-F", chain] => match chains.get_mut(*chain) {
                Some(rules) => {
                    rules.clear();
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, NO_CHAIN),
            },
            ["-L", chain] => {
                let refs = references(chains, *chain);
                match chains.get(*chain) {
                    Some(rules) => {
                        let mut out = format!(
                            "Chain {} ({} references)\ntarget     prot opt source               destination\n",
                            chain, refs
                        );
                        for rule in rules {
                            out.push_str(rule);
                            out.push('\n');
                        }
                        CommandOutput::ok(out)
                    }
                    None => CommandOutput::failed(1, NO_CHAIN),
                }
            }
            ["-A", chain, rule @ ..] => {
                let rule = rule.join(" ");
                if let Some(target) = jump_target(&rule)
                    && !TARGETS.iter().any(|t| *t == target)
                    && !chains.contains_key(target)
                {
                    return CommandOutput::failed(1, NO_CHAIN);
                }
                match chains.get_mut(*chain) {
                    Some(rules) => {
                        rules.push(rule);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, NO_CHAIN),
                }
            }
            ["-D", chain, rule @ ..] => {
                let rule = rule.join(" ");
                let Some(rules) = chains.get_mut(*chain) else {
                    return CommandOutput::failed(1, NO_CHAIN);
                };
                match rules.iter().position(|r| *r == rule) {
                    Some(index) => {
                        rules.remove(index);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, BAD_RULE),
                }
            }
            ["-C", chain, rule @ ..] => {
                let rule = rule.join(" ");
                match chains.get(*chain) {
                    Some(rules) if rules.contains(&rule) => CommandOutput::ok(""),
                    Some(_) => CommandOutput::failed(1, BAD_RULE),
                    None => CommandOutput::failed(1, NO_CHAIN),
                }
            }
            _ => CommandOutput::failed(2, "iptables: unsupported invocation"),
        }
    }

    fn ip(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["rule", "add", spec @ ..] => {
                let entry = Self::policy_entry(spec);
                if self.policy_rules.contains(&entry) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists");
                }
                self.policy_rules.push(entry);
                CommandOutput::ok("")
            }
            ["rule", "del", spec @ ..] => {
                let entry = Self::policy_entry(spec);
                match self.policy_rules.iter().position(|r| *r == entry) {
                    Some(index) => {
                        self.policy_rules.remove(index);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(2, "RTNETLINK answers: No such file or directory"),
                }
            }
            ["rule"] | ["rule", "show"] | ["rule", "list"] => {
                let mut out = String::from("0:\tfrom all lookup local\n");
                // Each added rule takes the next priority below main's.
                for (i, rule) in self.policy_rules.iter().enumerate().rev() {
                    out.push_str(&format!("{}:\tfrom all {}\n", 32765 - i, rule));
                }
                out.push_str("32766:\tfrom all lookup main\n32767:\tfrom all lookup default\n");
                CommandOutput::ok(out)
            }
            ["route", "show", filter @ ..] => self.show_routes(filter),
            ["route", op @ ("add" | "replace"), spec @ ..] => {
                let route = match parse_route(spec) {
                    Ok(route) => route,
                    Err(e) => return CommandOutput::failed(255, e),
                };
                if let Some(dev) = &route.dev {
                    match self.links.get(dev) {
                        None => return CommandOutput::failed(1, format!("Cannot find device \"{}\"", dev)),
                        Some(false) => return CommandOutput::failed(2, "RTNETLINK answers: Network is down"),
                        Some(true) => {}
                    }
                }
                if *op == "add" && self.routes.contains_key(&route.key) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists");
                }
                self.routes.insert(route.key, route.spec);
                CommandOutput::ok("")
            }
            ["route", "del", spec @ ..] => {
                let wanted = match parse_route(spec) {
                    Ok(route) => route,
                    Err(e) => return CommandOutput::failed(255, e),
                };
                let found = self
                    .routes
                    .iter()
                    .find(|(key, existing)| {
                        key.table == wanted.key.table
                            && key.kind == wanted.key.kind
                            && key.dest == wanted.key.dest
                            && (!wanted.has_metric || key.metric == wanted.key.metric)
                            && wanted
                                .dev
                                .as_deref()
                                .is_none_or(|dev| route_device(existing) == Some(dev))
                    })
                    .map(|(key, _)| key.clone());
                match found {
                    Some(key) => {
                        self.routes.remove(&key);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(2, "RTNETLINK answers: No such process"),
                }
            }
            ["tuntap", "add", "dev", dev, "mode", "tun"] => {
                if self.links.contains_key(*dev) {
                    return CommandOutput::failed(1, "ioctl(TUNSETIFF): Device or resource busy");
                }
                self.links.insert(dev.to_string(), false);
                CommandOutput::ok("")
            }
            ["tuntap", "del", "dev", dev, "mode", "tun"] => {
                if self.links.remove(*dev).is_none() {
                    return CommandOutput::failed(1, "ioctl(TUNSETIFF): No such device");
                }
                self.drop_routes_on(dev);
                CommandOutput::ok("")
            }
            ["link", "show", "dev", dev] | ["link", "show", dev] => {
                match self.links.keys().position(|name| name.as_str() == *dev) {
                    Some(index) => {
                        let up = self.links.get(*dev).copied().unwrap_or(false);
                        CommandOutput::ok(format!(
                            "{}: {}: <POINTOPOINT,NOARP{}> mtu 1500 qdisc noop state {} mode DEFAULT group default qlen 500\n",
                            index + 1,
                            dev,
                            if up { ",UP,LOWER_UP" } else { "" },
                            if up { "UNKNOWN" } else { "DOWN" }
                        ))
                    }
                    None => CommandOutput::failed(1, format!("Device \"{}\" does not exist.", dev)),
                }
            }
            ["link", "set", "dev", dev, state @ ("up" | "down")]
            | ["link", "set", dev, state @ ("up" | "down")] => {
                let up = *state == "up";
                match self.links.get_mut(*dev) {
                    Some(flag) => *flag = up,
                    None => return CommandOutput::failed(1, format!("Cannot find device \"{}\"", dev)),
                }
                if !up {
                    self.drop_routes_on(dev);
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(
                255,
                format!("Object \"{}\" is unknown, try \"ip help\".", args.first().unwrap_or(&"")),
            ),
        }
    }

    fn policy_entry(spec: &[&str]) -> String {
        spec.iter()
            .map(|token| if *token == "table" { "lookup" } else { *token })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn show_routes(&self, filter: &[&str]) -> CommandOutput {
        let (table, dest) = match filter {
            [] => (MAIN_TABLE, None),
            ["default"] => (MAIN_TABLE, Some("default")),
            ["table", "main"] => (MAIN_TABLE, None),
            ["table", n] => match n.parse() {
                Ok(t) => (t, None),
                Err(_) => return CommandOutput::failed(255, format!("Error: argument \"{}\" is wrong: table id value is invalid", n)),
            },
            _ => return CommandOutput::failed(255, "Error: unsupported route filter"),
        };
        let mut out = String::new();
        for (key, spec) in &self.routes {
            if key.table == table && dest.is_none_or(|d| key.dest == d && key.kind == "unicast") {
                out.push_str(spec);
                out.push('\n');
            }
        }
        CommandOutput::ok(out)
    }

    fn drop_routes_on(&mut self, dev: &str) {
        self.routes.retain(|_, spec| route_device(spec) != Some(dev));
    }

    fn networksetup(&mut self, args: &[&str]) -> CommandOutput {
        if args == ["-listallnetworkservices"] {
            let mut out = format!("{}\n", SERVICES_HEADER);
            for service in &self.services {
                out.push_str(service);
                out.push('\n');
            }
            return CommandOutput::ok(out);
        }

        let (verb, service, rest) = match args {
            [verb, service, rest @ ..] => (*verb, *service, rest),
            _ => return CommandOutput::failed(1, "** Error: unrecognized command"),
        };
        let Some((kind, is_state)) = proxy_kind(verb) else {
            return CommandOutput::failed(1, format!("** Error: {} is not a recognized command", verb));
        };
        if !self.services.iter().any(|s| s == service) {
            return CommandOutput {
                status: Some(4),
                stdout: format!("{} is not a recognized network service.\n", service),
                stderr: String::new(),
            };
        }
        let key = (service.to_string(), kind.to_string());
        match (is_state, rest) {
            (true, ["off"]) => {
                self.proxies.remove(&key);
                CommandOutput::ok("")
            }
            (true, ["on"]) => CommandOutput::ok(""),
            (false, [host, port]) => {
                self.proxies.insert(key, format!("{}:{}", host, port));
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "** Error: The parameters were not valid."),
        }
    }
}

struct FakeState {
    host: HostSnapshot,
    failures: Vec<String>,
    hangs: Vec<String>,
    history: Vec<String>,
}

/// A simulated host that records every command it receives.
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A host with built-in chains, a loopback interface and nothing else.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                host: HostSnapshot::default(),
                failures: Vec::new(),
                hangs: Vec::new(),
                history: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every command whose rendered line contains `needle`.
    pub fn fail_matching(&self, needle: impl Into<String>) {
        self.lock().failures.push(needle.into());
    }

    /// Time out every command whose rendered line contains `needle`.
    pub fn hang_matching(&self, needle: impl Into<String>) {
        self.lock().hangs.push(needle.into());
    }

    /// Remove injected failures and hangs.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.hangs.clear();
    }

    /// Every command received so far, rendered.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// Forget recorded commands.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Current observable state.
    pub fn snapshot(&self) -> HostSnapshot {
        self.lock().host.clone()
    }

    /// Install a main-table route such as
    /// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`.
    ///
    /// The device is created and brought up if missing.
    pub fn set_default_route(&self, route: &str) {
        let tokens: Vec<&str> = route.split_whitespace().collect();
        let mut state = self.lock();
        if let Ok(parsed) = parse_route(&tokens) {
            if let Some(dev) = &parsed.dev {
                state.host.links.insert(dev.clone(), true);
            }
            state.host.routes.insert(parsed.key, parsed.spec);
        }
    }

    /// Add an enabled network service.
    pub fn add_service(&self, name: &str) {
        let mut state = self.lock();
        if !state.host.services.iter().any(|s| s == name) {
            state.host.services.push(name.to_string());
        }
    }

    /// Remove a network service and its proxy settings.
    pub fn remove_service(&self, name: &str) {
        let mut state = self.lock();
        state.host.services.retain(|s| s != name);
        state.host.proxies.retain(|(service, _), _| service != name);
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let rendered = command.to_string();
        let mut state = self.lock();
        state.history.push(rendered.clone());

        if state.hangs.iter().any(|n| rendered.contains(n.as_str())) {
            return Err(ExecError::Timeout {
                command: rendered,
                timeout,
            });
        }
        if state.failures.iter().any(|n| rendered.contains(n.as_str())) {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        let program = Path::new(&command.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();

        match program {
            p if p.starts_with("iptables") => Ok(state.host.iptables(&args)),
            "ip" => Ok(state.host.ip(&args)),
            "networksetup" => Ok(state.host.networksetup(&args)),
            _ => Err(ExecError::Spawn {
                command: rendered,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(host: &FakeHost, program: &str, args: &[&str]) -> CommandOutput {
        host.run(&CommandLine::new(program, args.iter().copied()), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_iptables_chain_lifecycle() {
        let host = FakeHost::new();
        assert!(run(&host, "iptables", &["-w", "-t", "nat", "-N", "TP_RULE"]).await.success());
        assert_eq!(
            run(&host, "iptables", &["-t", "nat", "-N", "TP_RULE"]).await.stderr,
            CHAIN_EXISTS
        );
        assert!(run(&host, "iptables", &["-t", "nat", "-A", "OUTPUT", "-j", "TP_RULE"]).await.success());

        let referenced = run(&host, "iptables", &["-t", "nat", "-X", "TP_RULE"]).await;
        assert_eq!(referenced.stderr, TOO_MANY_LINKS);

        assert!(run(&host, "iptables", &["-t", "nat", "-D", "OUTPUT", "-j", "TP_RULE"]).await.success());
        assert_eq!(
            run(&host, "iptables", &["-t", "nat", "-D", "OUTPUT", "-j", "TP_RULE"]).await.stderr,
            BAD_RULE
        );
        assert!(run(&host, "iptables", &["-t", "nat", "-X", "TP_RULE"]).await.success());
        assert!(!run(&host, "iptables", &["-t", "nat", "-n", "-L", "TP_RULE"]).await.success());
    }

    #[tokio::test]
    async fn test_iptables_rejects_jump_to_missing_chain() {
        let host = FakeHost::new();
        let out = run(&host, "iptables", &["-t", "mangle", "-A", "OUTPUT", "-j", "TP_MARK"]).await;
        assert_eq!(out.stderr, NO_CHAIN);
        assert!(host.snapshot().rules("mangle", "OUTPUT").is_empty());
    }

    #[tokio::test]
    async fn test_policy_rule_listing() {
        let host = FakeHost::new();
        let add = ["rule", "add", "fwmark", "0x40/0xc0", "table", "100"];
        assert!(run(&host, "ip", &add).await.success());
        assert_eq!(run(&host, "ip", &add).await.stderr, "RTNETLINK answers: File exists");

        let listing = run(&host, "ip", &["rule", "show"]).await.stdout;
        assert!(listing.contains("32765:\tfrom all fwmark 0x40/0xc0 lookup 100"));
    }

    #[tokio::test]
    async fn test_route_on_down_link_fails() {
        let host = FakeHost::new();
        assert!(run(&host, "ip", &["tuntap", "add", "dev", "tp0", "mode", "tun"]).await.success());
        let out = run(&host, "ip", &["route", "replace", "default", "dev", "tp0"]).await;
        assert_eq!(out.stderr, "RTNETLINK answers: Network is down");

        assert!(run(&host, "ip", &["link", "set", "dev", "tp0", "up"]).await.success());
        assert!(run(&host, "ip", &["route", "replace", "default", "dev", "tp0"]).await.success());
        assert_eq!(host.snapshot().default_routes(), vec!["default dev tp0"]);

        assert!(run(&host, "ip", &["link", "set", "dev", "tp0", "down"]).await.success());
        assert!(host.snapshot().default_routes().is_empty());
    }

    #[tokio::test]
    async fn test_route_replace_keys_on_metric() {
        let host = FakeHost::new();
        host.set_default_route("default via 192.168.1.1 dev eth0 metric 100");
        host.set_default_route("default via 192.168.1.254 dev eth0 metric 100");
        host.set_default_route("default via 10.0.0.1 dev wlan0 metric 600");
        assert_eq!(
            host.snapshot().default_routes(),
            vec![
                "default via 192.168.1.254 dev eth0 metric 100",
                "default via 10.0.0.1 dev wlan0 metric 600",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_service_exit_code() {
        let host = FakeHost::new();
        let out = run(&host, "networksetup", &["-setwebproxystate", "Gone", "off"]).await;
        assert_eq!(out.status, Some(4));
        assert!(out.stdout.contains("is not a recognized network service"));
    }

    #[tokio::test]
    async fn test_injected_failures_and_hangs() {
        let host = FakeHost::new();
        host.fail_matching("-N TP_RULE");
        host.hang_matching("route show");

        let out = run(&host, "iptables", &["-t", "nat", "-N", "TP_RULE"]).await;
        assert_eq!(out.stderr, "injected failure");

        let err = host
            .run(&CommandLine::new("ip", ["route", "show", "default"]), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));

        host.clear_failures();
        assert!(run(&host, "iptables", &["-t", "nat", "-N", "TP_RULE"]).await.success());
        assert_eq!(host.history().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_program_is_spawn_error() {
        let host = FakeHost::new();
        let err = host
            .run(&CommandLine::new("nft", ["list", "ruleset"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
