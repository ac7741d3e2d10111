//! proxy-warden: supervisor for a local proxy engine and its transparent
//! routing rules.
//!
//! Parses the command line, loads the layered configuration, connects the
//! syslog audit trail and hands off to the orchestrator.
//!
//! Diagnostics go to stderr through `tracing`. Lifecycle events (engine
//! start/stop, rules applied/cleaned) go to syslog so they survive the
//! process.

use anyhow::{Context, Result};
use clap::Parser;
use proxy_warden::{cli::Cli, config::ConfigLoader, orchestrator, telemetry::AuditLogger};
use std::sync::Arc;
use tracing::{debug, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    let settings = config.settings().context("Invalid configuration")?;

    let audit = match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("Audit events will not be recorded: {}", e);
            AuditLogger::new_null()
        }
    };

    orchestrator::run(&cli, &settings, Arc::new(audit))
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
