//! Command-line interface definitions for proxy-warden.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::{EngineConfig, PortSet};
use crate::rules::{Platform, TransparentMode};

/// Supervisor for a local proxy engine and the transparent-proxy rules
/// that route traffic into it.
///
/// proxy-warden launches the engine with an already-generated config,
/// waits until it listens, then installs the host rules for the selected
/// transparent mode. Rules are removed before the engine is stopped, and
/// automatically when the engine dies.
#[derive(Parser, Debug)]
#[command(name = "proxy-warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Engine binary, overriding `engine.binary`.
    #[arg(long = "engine", value_name = "BINARY", global = true)]
    pub engine: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Ports the engine config binds.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortArgs {
    /// Transparent inbound port (redirect / tproxy target).
    #[arg(long = "transparent-port", value_name = "PORT")]
    pub transparent: Option<u16>,

    /// HTTP proxy inbound port.
    #[arg(long = "http-port", value_name = "PORT")]
    pub http: Option<u16>,

    /// SOCKS proxy inbound port.
    #[arg(long = "socks-port", value_name = "PORT")]
    pub socks: Option<u16>,
}

impl PortArgs {
    /// As a port set.
    pub fn port_set(&self) -> PortSet {
        PortSet {
            transparent: self.transparent,
            http: self.http,
            socks: self.socks,
        }
    }
}

/// Subcommands for proxy-warden.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine, apply rules, and hold until interrupted.
    ///
    /// On SIGINT or SIGTERM the rules are removed and the engine stopped.
    /// If the engine dies, its rules are removed and the command fails.
    Run {
        /// Materialized engine config file.
        #[arg(long = "engine-config", value_name = "PATH")]
        engine_config: PathBuf,

        /// Transparent mode: disabled, redirect, tproxy, tun, system_proxy.
        #[arg(short = 'm', long = "mode", default_value = "disabled")]
        mode: TransparentMode,

        /// Listening ports of the engine.
        #[command(flatten)]
        ports: PortArgs,

        /// Do not clean rules recorded by a previous run first.
        #[arg(long = "no-recover")]
        no_recover: bool,
    },

    /// Print the setup and cleanup commands for a mode without running them.
    Plan {
        /// Transparent mode.
        #[arg(short = 'm', long = "mode")]
        mode: TransparentMode,

        /// Build for another platform (linux, macos).
        #[arg(long = "platform")]
        platform: Option<Platform>,

        /// Listening ports of the engine.
        #[command(flatten)]
        ports: PortArgs,
    },

    /// Remove rules recorded in the journal by a previous run.
    Cleanup,
}

impl Commands {
    /// Engine config for `run`.
    pub fn engine_config(&self) -> Option<EngineConfig> {
        match self {
            Commands::Run {
                engine_config,
                ports,
                ..
            } => Some(EngineConfig::new(engine_config.clone(), ports.port_set())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from([
            "proxy-warden",
            "-vv",
            "run",
            "--engine-config",
            "/run/xray.json",
            "--mode",
            "redirect",
            "--transparent-port",
            "52345",
        ]);

        assert_eq!(cli.verbose, 2);
        match &cli.command {
            Commands::Run {
                mode, no_recover, ..
            } => {
                assert_eq!(*mode, TransparentMode::Redirect);
                assert!(!no_recover);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(
            cli.command.engine_config(),
            Some(EngineConfig::new("/run/xray.json", PortSet::transparent(52345)))
        );
    }

    #[test]
    fn test_cli_parse_run_defaults_to_disabled() {
        let cli = Cli::parse_from(["proxy-warden", "run", "--engine-config", "/run/xray.json"]);
        match cli.command {
            Commands::Run { mode, .. } => assert_eq!(mode, TransparentMode::Disabled),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_plan() {
        let cli = Cli::parse_from([
            "proxy-warden",
            "plan",
            "-m",
            "system-proxy",
            "--platform",
            "macos",
            "--http-port",
            "8080",
            "--socks-port",
            "1080",
            "--config",
            "/tmp/extra.toml",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
        match cli.command {
            Commands::Plan {
                mode,
                platform,
                ports,
            } => {
                assert_eq!(mode, TransparentMode::SystemProxy);
                assert_eq!(platform, Some(Platform::MacOs));
                assert_eq!(ports.port_set().listening(), vec![1080, 8080]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["proxy-warden", "plan", "--mode", "vpn"]).is_err());
    }

    #[test]
    fn test_cli_parse_cleanup_with_engine_override() {
        let cli = Cli::parse_from(["proxy-warden", "--engine", "/opt/xray", "cleanup"]);
        assert_eq!(cli.engine, Some(PathBuf::from("/opt/xray")));
        assert!(matches!(cli.command, Commands::Cleanup));
        assert_eq!(cli.command.engine_config(), None);
    }
}
