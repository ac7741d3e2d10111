//! Sequencing of engine lifecycle and host rules.
//!
//! [`Coordinator`] is the only component that knows both the engine process
//! and the rules pointing at it. Every change goes through
//! [`Coordinator::set_desired_state`], which holds a single lock for the
//! whole sequence:
//!
//! 1. clean the recorded batch, if any (failures are logged, not fatal)
//! 2. on a disable request, stop the engine and return
//! 3. replace the engine if its config differs from the requested one
//! 4. start the engine; stop here on failure
//! 5. build and apply the batch for the requested mode; on failure clean
//!    what was applied and stop the engine
//! 6. record the applied batch
//!
//! Rules are therefore never applied before the engine listens, and never
//! left behind once it is gone. An engine that dies on its own triggers a
//! cleanup task that queues behind any in-flight call and removes the batch
//! recorded for that process.

pub mod error;
pub mod record;

pub use error::{CoordinatorError, CoordinatorResult, ErrorKind};
pub use record::{AppliedBatch, AppliedRulesRecord, Journal};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;
use crate::rules::{RuleBatch, RuleEngine, RuleError, RuleResult, TransparentMode};
use crate::supervisor::{ProcessSupervisor, SupervisorState, UnexpectedExit};
use crate::telemetry::{AuditEvent, AuditLogger, CleanupTrigger};

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// How long a call waits for an in-flight one before failing with
    /// `Busy`. Zero rejects immediately.
    pub lock_timeout: Duration,
    /// Where the applied batch is mirrored, if anywhere.
    pub journal: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            journal: None,
        }
    }
}

/// Point-in-time view for the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Supervisor state.
    pub state: SupervisorState,
    /// Engine pid, when a process is live.
    pub pid: Option<u32>,
    /// Mode whose rules are applied.
    pub mode: TransparentMode,
    /// Time since the engine was launched.
    pub uptime: Option<Duration>,
}

struct Inner {
    supervisor: ProcessSupervisor,
    rules: RuleEngine,
    audit: Arc<AuditLogger>,
    lock_timeout: Duration,
    /// Serialization lock; the record is only touched while holding it.
    record: tokio::sync::Mutex<AppliedRulesRecord>,
    /// Mirror of the recorded mode, readable without the lock.
    active: Mutex<TransparentMode>,
}

/// Drives the engine and the host rules towards a desired state.
///
/// Cheap to clone; clones share the same engine, rules and lock.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Take ownership of `supervisor` and register the crash cleanup on it.
    ///
    /// Must be called inside a Tokio runtime: crash cleanup runs as a task.
    pub fn new(
        supervisor: ProcessSupervisor,
        rules: RuleEngine,
        audit: Arc<AuditLogger>,
        settings: CoordinatorSettings,
    ) -> Self {
        let record = match settings.journal {
            Some(path) => AppliedRulesRecord::with_journal(Journal::new(path)),
            None => AppliedRulesRecord::new(),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            supervisor.on_unexpected_exit(move |event| {
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_unexpected_exit(event).await;
                    }
                });
            });
            Inner {
                supervisor,
                rules,
                audit,
                lock_timeout: settings.lock_timeout,
                record: tokio::sync::Mutex::new(record),
                active: Mutex::new(TransparentMode::Disabled),
            }
        });

        Self { inner }
    }

    /// The engine supervisor.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    /// The rule engine.
    pub fn rules(&self) -> &RuleEngine {
        &self.inner.rules
    }

    /// Make the engine run `config` with `mode` rules, or tear everything
    /// down when `config` is `None`.
    ///
    /// Calls are serialized. A call that cannot take the lock within the
    /// lock timeout fails with [`ErrorKind::Busy`] without side effects.
    pub async fn set_desired_state(
        &self,
        config: Option<EngineConfig>,
        mode: TransparentMode,
    ) -> CoordinatorResult<()> {
        let mut record = self.inner.acquire().await?;
        self.inner.apply_desired(&mut record, config, mode).await
    }

    /// Tear everything down: clean rules, stop the engine.
    pub async fn shutdown(&self) -> CoordinatorResult<()> {
        self.set_desired_state(None, TransparentMode::Disabled).await
    }

    /// Clean a batch left in the journal by a previous run.
    ///
    /// Returns the mode that was cleaned, `None` when nothing was recorded.
    /// The journal is cleared even if cleanup fails, and an unreadable one
    /// is moved aside. While this coordinator has rules applied the journal
    /// mirrors them and is left alone.
    pub async fn recover_stale(&self) -> CoordinatorResult<Option<TransparentMode>> {
        let record = self.inner.acquire().await?;
        let Some(journal) = record.journal() else {
            return Ok(None);
        };
        if let Some(live) = record.current() {
            debug!(
                "{} rules of generation {} are live, journal is not stale",
                live.batch.mode(),
                live.generation
            );
            return Ok(None);
        }
        let stale = match journal.load() {
            Ok(Some(stale)) => stale,
            Ok(None) => {
                debug!("No stale rules in {}", journal.path().display());
                return Ok(None);
            }
            Err(e @ CoordinatorError::JournalCorrupt { .. }) => {
                let moved_to = journal.set_aside()?;
                warn!("{}; moved to {}", e, moved_to.display());
                self.inner.audit.log(AuditEvent::JournalDiscarded {
                    path: journal.path().display().to_string(),
                    moved_to: moved_to.display().to_string(),
                    reason: e.to_string(),
                });
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mode = stale.batch.mode();
        warn!(
            "Found {} rules left by a previous run (applied {}), cleaning",
            mode, stale.applied_at
        );
        let cleaned = self.inner.clean(&stale.batch, CleanupTrigger::StaleJournal).await;
        journal.clear()?;
        cleaned?;
        Ok(Some(mode))
    }

    /// Current engine state and active mode.
    pub fn status(&self) -> Status {
        let supervisor = &self.inner.supervisor;
        Status {
            state: supervisor.state(),
            pid: supervisor.pid(),
            mode: self.inner.active_mode(),
            uptime: supervisor.uptime(),
        }
    }

    /// Copy of the recorded batch. Waits for any in-flight call.
    pub async fn applied(&self) -> Option<AppliedBatch> {
        self.inner.record.lock().await.current().cloned()
    }
}

impl Inner {
    async fn acquire(&self) -> CoordinatorResult<MutexGuard<'_, AppliedRulesRecord>> {
        let started = Instant::now();
        let guard = if self.lock_timeout.is_zero() {
            self.record.try_lock().ok()
        } else {
            tokio::time::timeout(self.lock_timeout, self.record.lock())
                .await
                .ok()
        };
        guard.ok_or_else(|| {
            let waited = started.elapsed();
            warn!("Rejecting state change: another one is in progress");
            CoordinatorError::Busy { waited }
        })
    }

    fn active_mode(&self) -> TransparentMode {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active(&self, mode: TransparentMode) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    async fn apply_desired(
        &self,
        record: &mut AppliedRulesRecord,
        config: Option<EngineConfig>,
        mode: TransparentMode,
    ) -> CoordinatorResult<()> {
        let stale_cleanup = match record.take() {
            Some(applied) => {
                let result = self.clean(&applied.batch, CleanupTrigger::Replace).await;
                self.set_active(TransparentMode::Disabled);
                result.err()
            }
            None => None,
        };

        let Some(config) = config else {
            self.stop_engine(true).await;
            info!("Transparent proxy disabled");
            return match stale_cleanup {
                Some(e) => Err(e.into()),
                None => Ok(()),
            };
        };

        if self.supervisor.running() && self.supervisor.current_config().as_ref() == Some(&config) {
            debug!("Engine already running this config, keeping it");
        } else {
            self.stop_engine(true).await;
            self.start_engine(&config).await?;
        }

        if mode == TransparentMode::Disabled {
            info!("Engine running without transparent rules");
            return Ok(());
        }

        let (Some(generation), Some(pid)) = (self.supervisor.generation(), self.supervisor.pid())
        else {
            return Err(self.engine_gone(0));
        };
        let batch = match self.rules.build_batch(mode, config.ports()).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Cannot build {} rules: {}", mode, e);
                self.stop_engine(false).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.rules.apply(&batch).await {
            if let RuleError::Apply {
                step, diagnostic, ..
            } = &e
            {
                self.audit.log(AuditEvent::RulesApplyFailed {
                    mode: mode.to_string(),
                    step: step.clone(),
                    diagnostic: diagnostic.clone(),
                });
            }
            warn!("{}; cleaning up and stopping engine", e);
            let _ = self.clean(&batch, CleanupTrigger::ApplyFailed).await;
            self.stop_engine(false).await;
            return Err(e.into());
        }

        if !self.supervisor.running() || self.supervisor.generation() != Some(generation) {
            let err = self.engine_gone(pid);
            warn!("{}; removing its rules", err);
            let _ = self.clean(&batch, CleanupTrigger::EngineExited).await;
            return Err(err);
        }

        self.audit.log(AuditEvent::RulesApplied {
            mode: mode.to_string(),
            platform: batch
                .platform()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            steps: batch.setup.len(),
        });
        record.set(AppliedBatch::new(batch, generation));
        self.set_active(mode);
        info!("Transparent proxy active in {} mode", mode);
        Ok(())
    }

    /// Error for an engine that vanished mid-sequence.
    fn engine_gone(&self, pid: u32) -> CoordinatorError {
        CoordinatorError::EngineExited {
            pid,
            status: format!("is {}", self.supervisor.state()),
            diagnostic: self
                .supervisor
                .output()
                .map(|lines| lines.join("\n"))
                .unwrap_or_default(),
        }
    }

    async fn start_engine(&self, config: &EngineConfig) -> CoordinatorResult<()> {
        match self.supervisor.start(config).await {
            Ok(()) => {
                self.audit.log(AuditEvent::EngineStarted {
                    pid: self.supervisor.pid().unwrap_or_default(),
                    generation: self.supervisor.generation().unwrap_or_default(),
                    config: config.path().display().to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let err = CoordinatorError::from(e);
                self.audit.log(AuditEvent::EngineStartFailed {
                    kind: err.kind().to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn stop_engine(&self, graceful: bool) {
        if self.supervisor.state() == SupervisorState::Stopped {
            return;
        }
        let pid = self.supervisor.pid();
        if let Err(e) = self.supervisor.stop(graceful).await {
            warn!("Failed to stop engine: {}", e);
            return;
        }
        self.audit.log(AuditEvent::EngineStopped { pid, graceful });
    }

    /// Run the batch's cleanup. Failures are logged and returned.
    async fn clean(&self, batch: &RuleBatch, trigger: CleanupTrigger) -> RuleResult<()> {
        let result = self.rules.clean(batch).await;
        let failures = match &result {
            Ok(()) => 0,
            Err(RuleError::Cleanup { failures, .. }) => failures.len(),
            Err(_) => 1,
        };
        if let Err(e) = &result {
            warn!("{}", e);
        }
        self.audit.log(AuditEvent::RulesCleaned {
            mode: batch.mode().to_string(),
            trigger,
            failures,
        });
        result
    }

    async fn handle_unexpected_exit(&self, event: UnexpectedExit) {
        self.audit.log(AuditEvent::EngineExited {
            pid: event.pid,
            generation: event.generation,
            status: event.status.clone(),
        });

        // Crash cleanup always queues; it is never rejected as busy.
        let mut record = self.record.lock().await;
        let ours = record
            .current()
            .is_some_and(|applied| applied.generation == event.generation);
        if !ours {
            debug!(
                "No rules recorded for engine generation {}, nothing to clean",
                event.generation
            );
            return;
        }

        if let Some(applied) = record.take() {
            warn!(
                "Engine pid {} {}; removing {} rules",
                event.pid,
                event.status,
                applied.batch.mode()
            );
            let _ = self.clean(&applied.batch, CleanupTrigger::EngineExited).await;
            self.set_active(TransparentMode::Disabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PortSet;
    use crate::exec::CommandExecutor;
    use crate::rules::{Platform, RuleSettings};
    use crate::supervisor::{LogLineMatch, SupervisorSettings};
    use crate::testing::FakeHost;

    fn coordinator(host: &Arc<FakeHost>, script: &str, lock_timeout: Duration) -> Coordinator {
        let supervisor = ProcessSupervisor::new(
            SupervisorSettings {
                binary: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
                startup_timeout: Duration::from_secs(3),
                stop_grace: Duration::from_secs(2),
                probe_interval: Duration::from_millis(20),
                output_lines: 16,
            },
            Arc::new(LogLineMatch("ready".to_string())),
        );
        let executor = CommandExecutor::new(host.clone(), Duration::from_secs(1));
        let rules = RuleEngine::with_platform(executor, RuleSettings::default(), Platform::Linux);
        Coordinator::new(
            supervisor,
            rules,
            Arc::new(AuditLogger::new_null()),
            CoordinatorSettings {
                lock_timeout,
                journal: None,
            },
        )
    }

    fn config(port: u16) -> EngineConfig {
        EngineConfig::new(format!("/run/engine-{}.json", port), PortSet::transparent(port))
    }

    const ENGINE: &str = "echo ready; exec sleep 30";

    #[tokio::test]
    async fn test_enable_then_disable() {
        let host = Arc::new(FakeHost::new());
        let before = host.snapshot();
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap();
        let status = coord.status();
        assert_eq!(status.state, SupervisorState::Running);
        assert_eq!(status.mode, TransparentMode::Redirect);
        assert!(status.pid.is_some());
        assert!(host.snapshot().has_chain("nat", "TP_RULE"));
        assert_eq!(coord.applied().await.map(|a| a.generation), Some(1));

        coord.shutdown().await.unwrap();
        assert_eq!(coord.status().state, SupervisorState::Stopped);
        assert_eq!(coord.status().mode, TransparentMode::Disabled);
        assert!(coord.applied().await.is_none());
        assert_eq!(host.snapshot(), before);
    }

    #[tokio::test]
    async fn test_disable_while_disabled_issues_nothing() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        coord.shutdown().await.unwrap();
        coord
            .set_desired_state(None, TransparentMode::Redirect)
            .await
            .unwrap();
        assert!(host.history().is_empty());
        assert_eq!(coord.status().state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_engine_without_rules() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        coord
            .set_desired_state(Some(config(1080)), TransparentMode::Disabled)
            .await
            .unwrap();
        assert!(coord.supervisor().running());
        assert!(host.history().is_empty());
        assert!(coord.applied().await.is_none());
        coord.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_config_keeps_process() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap();
        let pid = coord.status().pid;
        coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap();
        assert_eq!(coord.status().pid, pid);
        assert_eq!(coord.supervisor().generation(), Some(1));
        assert_eq!(host.snapshot().rules("nat", "TP_RULE").len(), 1);

        coord
            .set_desired_state(Some(config(52346)), TransparentMode::Redirect)
            .await
            .unwrap();
        assert_ne!(coord.status().pid, pid);
        assert_eq!(coord.supervisor().generation(), Some(2));
        let rules = host.snapshot().rules("nat", "TP_RULE");
        assert_eq!(rules.len(), 1);
        assert!(rules[0].ends_with("--to-ports 52346"));
        coord.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_applies_nothing() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, "echo 'bad config' >&2; exit 1", Duration::from_secs(5));

        let err = coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessStart);
        assert!(err.diagnostic().contains("bad config"));
        assert!(host.history().is_empty());
        assert_eq!(coord.status().state, SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_apply_failure_cleans_and_stops() {
        let host = Arc::new(FakeHost::new());
        let before = host.snapshot();
        host.fail_matching("-A OUTPUT -j TP_RULE");
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        let err = coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuleApply);
        assert_eq!(coord.status().state, SupervisorState::Stopped);
        assert!(coord.applied().await.is_none());
        assert_eq!(host.snapshot(), before);
    }

    #[tokio::test]
    async fn test_unsupported_mode_stops_engine() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));

        let err = coord
            .set_desired_state(Some(config(52345)), TransparentMode::SystemProxy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
        assert_eq!(coord.status().state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_port_is_invalid_ports() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(5));
        let cfg = EngineConfig::new(
            "/run/engine.json",
            PortSet {
                socks: Some(1080),
                ..Default::default()
            },
        );

        let err = coord
            .set_desired_state(Some(cfg), TransparentMode::Redirect)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPorts);
        assert!(!coord.supervisor().running());
    }

    #[tokio::test]
    async fn test_busy_when_lock_held() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, "sleep 0.5; echo ready; exec sleep 30", Duration::ZERO);

        let first = tokio::spawn({
            let coord = coord.clone();
            async move {
                coord
                    .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
                    .await
            }
        });
        // The first call holds the lock while the engine starts.
        for _ in 0..200 {
            if coord.status().state == SupervisorState::Starting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = coord.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        first.await.unwrap().unwrap();
        assert_eq!(coord.status().mode, TransparentMode::Redirect);
        coord.shutdown().await.unwrap();
        assert!(!host.snapshot().has_chain("nat", "TP_RULE"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_queue() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, ENGINE, Duration::from_secs(10));

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let coord = coord.clone();
                tokio::spawn(async move {
                    coord
                        .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
                        .await
                })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(coord.supervisor().generation(), Some(1));
        assert_eq!(host.snapshot().rules("nat", "TP_RULE").len(), 1);
        coord.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_cleans_recorded_rules() {
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&host, "echo ready; sleep 0.5; exit 3", Duration::from_secs(5));

        coord
            .set_desired_state(Some(config(52345)), TransparentMode::Redirect)
            .await
            .unwrap();
        assert!(host.snapshot().has_chain("nat", "TP_RULE"));

        for _ in 0..300 {
            if !host.snapshot().has_chain("nat", "TP_RULE") && coord.applied().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!host.snapshot().has_chain("nat", "TP_RULE"));
        assert!(coord.applied().await.is_none());
        assert_eq!(coord.status().state, SupervisorState::Failed);
        assert_eq!(coord.status().mode, TransparentMode::Disabled);
    }

    #[tokio::test]
    async fn test_recover_stale_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applied.json");
        let host = Arc::new(FakeHost::new());
        let before = host.snapshot();

        // A previous run applied rules and died without cleaning.
        let executor = CommandExecutor::new(host.clone(), Duration::from_secs(1));
        let rules = RuleEngine::with_platform(executor, RuleSettings::default(), Platform::Linux);
        let batch = rules
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap();
        rules.apply(&batch).await.unwrap();
        Journal::new(&path).store(&AppliedBatch::new(batch, 1)).unwrap();

        let supervisor = ProcessSupervisor::new(
            SupervisorSettings::default(),
            Arc::new(LogLineMatch("ready".to_string())),
        );
        let coord = Coordinator::new(
            supervisor,
            rules,
            Arc::new(AuditLogger::new_null()),
            CoordinatorSettings {
                lock_timeout: Duration::from_secs(1),
                journal: Some(path.clone()),
            },
        );

        assert_eq!(coord.recover_stale().await.unwrap(), Some(TransparentMode::Redirect));
        assert_eq!(host.snapshot(), before);
        assert!(!path.exists());
        assert_eq!(coord.recover_stale().await.unwrap(), None);
    }
}
