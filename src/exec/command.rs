//! Command model: a command line, the probes that guard it, and a batch step.
//!
//! Steps are plain data so a batch can be rendered for a dry run, persisted
//! in the applied-rules journal, and replayed for cleanup without being
//! re-derived.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::runner::CommandOutput;

/// A program and its arguments. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandLine {
    /// Program name or path.
    pub program: String,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Build a command line from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// A read-only command that tells whether some piece of host state exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// The query to run.
    pub command: CommandLine,
    /// When set, the state exists only if a line of stdout contains these
    /// whitespace-separated words in sequence (for queries that succeed
    /// whether or not the state exists). Words match whole, so `dev tp0`
    /// does not match `dev tp01`.
    pub contains: Option<String>,
}

impl Probe {
    /// State exists iff the query exits successfully.
    pub fn succeeds(command: CommandLine) -> Self {
        Self {
            command,
            contains: None,
        }
    }

    /// State exists iff the query succeeds and prints `needle`.
    pub fn output_contains(command: CommandLine, needle: impl Into<String>) -> Self {
        Self {
            command,
            contains: Some(needle.into()),
        }
    }

    /// Evaluate the probe against the query's output.
    pub fn matches(&self, output: &CommandOutput) -> bool {
        if !output.success() {
            return false;
        }
        match &self.contains {
            Some(needle) => {
                let words: Vec<&str> = needle.split_whitespace().collect();
                !words.is_empty()
                    && output.stdout.lines().any(|line| {
                        let tokens: Vec<&str> = line.split_whitespace().collect();
                        tokens.windows(words.len()).any(|w| w == words.as_slice())
                    })
            }
            None => true,
        }
    }
}

/// Condition deciding whether a step needs to run at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// Setup side: skip the step when the probe says the state is already present.
    SkipWhenPresent(Probe),
    /// Cleanup side: run the step only when the probe says the state is present.
    RunWhenPresent(Probe),
}

impl Guard {
    /// The probe backing this guard.
    pub fn probe(&self) -> &Probe {
        match self {
            Guard::SkipWhenPresent(probe) | Guard::RunWhenPresent(probe) => probe,
        }
    }

    /// Whether the step should run given the probe outcome.
    pub fn should_run(&self, present: bool) -> bool {
        match self {
            Guard::SkipWhenPresent(_) => !present,
            Guard::RunWhenPresent(_) => present,
        }
    }
}

/// One atomic step of a rule batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Short human description, used in logs and error messages.
    pub description: String,
    /// The mutation to perform.
    pub command: CommandLine,
    /// Optional check-before-act guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Output fragments that turn a non-zero exit into success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerated: Vec<String>,
}

impl Step {
    /// Create an unguarded step.
    pub fn new(description: impl Into<String>, command: CommandLine) -> Self {
        Self {
            description: description.into(),
            command,
            guard: None,
            tolerated: Vec::new(),
        }
    }

    /// Skip this step when `probe` reports the state already exists.
    pub fn unless_present(mut self, probe: Probe) -> Self {
        self.guard = Some(Guard::SkipWhenPresent(probe));
        self
    }

    /// Run this step only when `probe` reports the state exists.
    pub fn when_present(mut self, probe: Probe) -> Self {
        self.guard = Some(Guard::RunWhenPresent(probe));
        self
    }

    /// Treat a failure whose output contains `fragment` as success.
    pub fn tolerate(mut self, fragment: impl Into<String>) -> Self {
        self.tolerated.push(fragment.into());
        self
    }

    /// Whether a failed run of this step is covered by a tolerated fragment.
    pub fn is_tolerated(&self, output: &CommandOutput) -> bool {
        self.tolerated.iter().any(|fragment| {
            output.stderr.contains(fragment.as_str()) || output.stdout.contains(fragment.as_str())
        })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: Some(status),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_command_line_display_quotes_whitespace() {
        let cmd = CommandLine::new("networksetup", ["-setwebproxy", "Wi-Fi", "127.0.0.1", "8080"]);
        assert_eq!(cmd.to_string(), "networksetup -setwebproxy Wi-Fi 127.0.0.1 8080");

        let cmd = CommandLine::new("networksetup", ["-setwebproxystate", "USB 10/100 LAN", "off"]);
        assert_eq!(
            cmd.to_string(),
            "networksetup -setwebproxystate 'USB 10/100 LAN' off"
        );
    }

    #[test]
    fn test_probe_succeeds() {
        let probe = Probe::succeeds(CommandLine::new("ip", ["link", "show", "dev", "tp0"]));
        assert!(probe.matches(&output(0, "", "")));
        assert!(!probe.matches(&output(1, "", "Device \"tp0\" does not exist.")));
    }

    #[test]
    fn test_probe_output_contains() {
        let probe = Probe::output_contains(
            CommandLine::new("ip", ["rule", "show"]),
            "fwmark 0x40/0xc0 lookup 100",
        );
        assert!(probe.matches(&output(0, "32765:\tfrom all fwmark 0x40/0xc0 lookup 100\n", "")));
        assert!(!probe.matches(&output(0, "0:\tfrom all lookup local\n", "")));
        assert!(!probe.matches(&output(2, "fwmark 0x40/0xc0 lookup 100", "")));
        assert!(!probe.matches(&output(0, "32765:\tfrom all fwmark 0x40/0xc0 lookup 1000\n", "")));
    }

    #[test]
    fn test_probe_matches_whole_words() {
        let probe = Probe::output_contains(
            CommandLine::new("ip", ["route", "show", "default"]),
            "dev tp0",
        );
        assert!(probe.matches(&output(0, "default dev tp0 scope link\n", "")));
        assert!(probe.matches(&output(0, "default via 10.0.0.1 dev eth0\ndefault dev tp0\n", "")));
        assert!(!probe.matches(&output(0, "default dev tp01 scope link\n", "")));
        assert!(!probe.matches(&output(0, "default via 10.0.0.1 dev eth0\n", "")));
    }

    #[test]
    fn test_guard_should_run() {
        let probe = Probe::succeeds(CommandLine::new("true", Vec::<String>::new()));
        let setup = Guard::SkipWhenPresent(probe.clone());
        let cleanup = Guard::RunWhenPresent(probe);

        assert!(setup.should_run(false));
        assert!(!setup.should_run(true));
        assert!(cleanup.should_run(true));
        assert!(!cleanup.should_run(false));
    }

    #[test]
    fn test_step_tolerated_output() {
        let step = Step::new(
            "disable web proxy on Wi-Fi",
            CommandLine::new("networksetup", ["-setwebproxystate", "Wi-Fi", "off"]),
        )
        .tolerate("is not a recognized network service");

        assert!(step.is_tolerated(&output(
            4,
            "Wi-Fi is not a recognized network service.\n",
            ""
        )));
        assert!(!step.is_tolerated(&output(1, "", "permission denied")));
    }

    #[test]
    fn test_step_roundtrips_through_json() {
        let step = Step::new(
            "create chain TP_RULE",
            CommandLine::new("iptables", ["-w", "-t", "nat", "-N", "TP_RULE"]),
        )
        .unless_present(Probe::succeeds(CommandLine::new(
            "iptables",
            ["-w", "-t", "nat", "-n", "-L", "TP_RULE"],
        )));

        let json = serde_json::to_string(&step).unwrap();
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}
