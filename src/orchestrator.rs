//! Wiring of configuration, supervisor, rule engine and coordinator for the
//! binary's subcommands.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::Settings;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::engine::{EngineConfig, PortSet};
use crate::exec::{CommandExecutor, SystemRunner};
use crate::rules::{Platform, RuleEngine, TransparentMode};
use crate::supervisor::{ProcessSupervisor, SupervisorState};
use crate::telemetry::AuditLogger;

/// How often `run` checks whether the engine is still alive.
const HEALTH_INTERVAL: Duration = Duration::from_millis(500);

/// Run the subcommand selected on the command line.
pub fn run(cli: &Cli, settings: &Settings, audit: Arc<AuditLogger>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        match &cli.command {
            Commands::Run {
                mode, no_recover, ..
            } => {
                let config = cli
                    .command
                    .engine_config()
                    .ok_or_else(|| anyhow!("run requires an engine config"))?;
                run_engine(settings, audit, config, *mode, *no_recover).await
            }
            Commands::Plan {
                mode,
                platform,
                ports,
            } => plan(settings, *mode, platform.unwrap_or_else(Platform::detect), &ports.port_set()).await,
            Commands::Cleanup => cleanup(settings, audit).await,
        }
    })
}

fn rule_engine(settings: &Settings, platform: Platform) -> RuleEngine {
    let executor = CommandExecutor::new(Arc::new(SystemRunner), settings.rules.command_timeout);
    RuleEngine::with_platform(executor, settings.rules.clone(), platform)
}

fn coordinator(settings: &Settings, audit: Arc<AuditLogger>) -> Coordinator {
    let supervisor = ProcessSupervisor::new(settings.supervisor.clone(), settings.readiness_check());
    Coordinator::new(
        supervisor,
        rule_engine(settings, Platform::detect()),
        audit,
        settings.coordinator.clone(),
    )
}

/// Surface a coordinator error with its stable kind.
fn surface(e: CoordinatorError) -> anyhow::Error {
    anyhow!("[{}] {}", e.kind(), e.diagnostic())
}

async fn run_engine(
    settings: &Settings,
    audit: Arc<AuditLogger>,
    config: EngineConfig,
    mode: TransparentMode,
    no_recover: bool,
) -> Result<()> {
    if !config.path().exists() {
        anyhow::bail!("Engine config not found: {}", config.path().display());
    }

    let coordinator = coordinator(settings, audit);
    if !no_recover
        && let Some(stale) = coordinator.recover_stale().await.map_err(surface)?
    {
        info!("Removed stale {} rules from a previous run", stale);
    }

    coordinator
        .set_desired_state(Some(config), mode)
        .await
        .map_err(surface)
        .context("Failed to start transparent proxy")?;

    let status = coordinator.status();
    info!(
        "Engine running (pid {}), transparent mode {}",
        status.pid.unwrap_or_default(),
        status.mode
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let outcome = hold(&coordinator, shutdown_rx).await;

    coordinator
        .shutdown()
        .await
        .map_err(surface)
        .context("Failed to tear down transparent proxy")?;
    outcome
}

/// Wait until shutdown is requested or the engine dies.
async fn hold(coordinator: &Coordinator, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
            _ = health.tick() => {
                if coordinator.status().state == SupervisorState::Failed {
                    let Some(exit) = coordinator.supervisor().last_exit() else {
                        anyhow::bail!("Engine exited unexpectedly");
                    };
                    warn!("Engine pid {} {}", exit.pid, exit.status);
                    anyhow::bail!(
                        "Engine {}{}",
                        exit.status,
                        render_output(&exit.diagnostic)
                    );
                }
            }
        }
    }
}

fn render_output(output: &str) -> String {
    if output.trim().is_empty() {
        String::new()
    } else {
        format!(":\n{}", output.trim_end())
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        return;
    }

    let _ = tokio::signal::ctrl_c().await;
}

async fn plan(settings: &Settings, mode: TransparentMode, platform: Platform, ports: &PortSet) -> Result<()> {
    debug!("Planning {} rules for {} with ports {:?}", mode, platform, ports);
    let batch = rule_engine(settings, platform)
        .build_batch(mode, ports)
        .await
        .map_err(|e| surface(e.into()))?;
    print!("{}", batch.render());
    Ok(())
}

async fn cleanup(settings: &Settings, audit: Arc<AuditLogger>) -> Result<()> {
    let Some(journal) = &settings.coordinator.journal else {
        println!("Journal disabled; nothing recorded to clean");
        return Ok(());
    };

    match coordinator(settings, audit).recover_stale().await.map_err(surface)? {
        Some(mode) => println!("Removed {} rules recorded in {}", mode, journal.display()),
        None => println!("No rules recorded in {}", journal.display()),
    }
    Ok(())
}
