//! Lifecycle of the external engine process.
//!
//! [`ProcessSupervisor`] owns at most one engine process and exposes a small
//! state machine (see [`state`]). `start` and `stop` take an operation lock,
//! so two starts can never race to create two processes. `start` gives the
//! lock up once its process is `Starting`; a stop issued then takes over the
//! process and the pending start returns `StartCancelled`. A watcher task
//! per process observes exit independently of callers; an exit while
//! `Running` moves the state to `Failed` and fires the unexpected-exit
//! callback.

pub mod error;
pub mod handle;
pub mod output;
pub mod readiness;
pub mod settings;
pub mod state;

pub use error::SupervisorError;
pub use handle::{ExitReport, ProcessHandle, StopSignal};
pub use output::OutputLog;
pub use readiness::{LogLineMatch, PortsListening, ReadinessCheck, ReadinessContext};
pub use settings::SupervisorSettings;
pub use state::SupervisorState;

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;

/// Details of an engine that exited on its own while `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedExit {
    /// Generation of the process that exited.
    pub generation: u64,
    /// Its pid.
    pub pid: u32,
    /// How it ended.
    pub status: String,
    /// Captured output.
    pub diagnostic: String,
}

/// Callback fired from the watcher task on an unexpected exit.
pub type ExitCallback = Arc<dyn Fn(UnexpectedExit) + Send + Sync>;

#[derive(Default)]
struct Slot {
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    config: Option<EngineConfig>,
    last_exit: Option<UnexpectedExit>,
}

impl Slot {
    /// Whether the slot still holds the process of `generation` in `Starting`.
    fn owned_by(&self, generation: u64) -> bool {
        self.state == SupervisorState::Starting
            && self
                .handle
                .as_ref()
                .is_some_and(|h| h.generation == generation)
    }
}

struct Shared {
    settings: SupervisorSettings,
    readiness: Arc<dyn ReadinessCheck>,
    ops: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    on_unexpected_exit: Mutex<Option<ExitCallback>>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callback(&self) -> Option<ExitCallback> {
        self.on_unexpected_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Outcome of waiting for readiness.
enum Startup {
    Ready,
    Exited(ExitReport),
    TimedOut,
    Cancelled,
}

/// Owns the engine process.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Create a supervisor in `Stopped`.
    pub fn new(settings: SupervisorSettings, readiness: Arc<dyn ReadinessCheck>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                readiness,
                ops: tokio::sync::Mutex::new(()),
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
                on_unexpected_exit: Mutex::new(None),
            }),
        }
    }

    /// Register the unexpected-exit callback, replacing any previous one.
    pub fn on_unexpected_exit<F>(&self, callback: F)
    where
        F: Fn(UnexpectedExit) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_unexpected_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Launch and default settings.
    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.shared.slot().state
    }

    /// Whether the engine is `Running`.
    pub fn running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// Pid of the live process.
    pub fn pid(&self) -> Option<u32> {
        self.shared.slot().handle.as_ref().map(|h| h.pid)
    }

    /// Generation of the live process.
    pub fn generation(&self) -> Option<u64> {
        self.shared.slot().handle.as_ref().map(|h| h.generation)
    }

    /// Time since the live process was launched.
    pub fn uptime(&self) -> Option<Duration> {
        self.shared
            .slot()
            .handle
            .as_ref()
            .map(|h| h.started_at.elapsed())
    }

    /// Config of the live process.
    pub fn current_config(&self) -> Option<EngineConfig> {
        let slot = self.shared.slot();
        if slot.state.has_process() {
            slot.config.clone()
        } else {
            None
        }
    }

    /// Captured output of the live process.
    pub fn output(&self) -> Option<Vec<String>> {
        self.shared.slot().handle.as_ref().map(|h| h.output.lines())
    }

    /// The most recent unexpected exit, until the next start.
    pub fn last_exit(&self) -> Option<UnexpectedExit> {
        self.shared.slot().last_exit.clone()
    }

    /// Launch the engine with `config` and wait until it is ready.
    ///
    /// Valid from `Stopped` and `Failed`. On exit before readiness, or when
    /// the startup timeout elapses, the process is gone and the state is
    /// `Failed`. The operation lock is released once the process is
    /// `Starting`, so a concurrent [`stop`](Self::stop) cancels the start.
    pub async fn start(&self, config: &EngineConfig) -> Result<(), SupervisorError> {
        self.check_can_start()?;
        let ops = self.shared.ops.lock().await;
        self.check_can_start()?;

        let settings = &self.shared.settings;
        let args = settings.command_args(config.path());
        debug!("Launching engine: {} {}", settings.binary.display(), args.join(" "));

        let child = Command::new(&settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                self.transition(SupervisorState::Failed);
                return Err(SupervisorError::Spawn {
                    binary: settings.binary.clone(),
                    source: e,
                });
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let output = OutputLog::new(settings.output_lines);
        let handle = handle::launch(
            child,
            generation,
            output.clone(),
            settings.stop_grace,
            natural_exit_hook(Arc::downgrade(&self.shared), generation),
        );
        let pid = handle.pid;
        let exit = handle.exit_receiver();

        {
            let mut slot = self.shared.slot();
            slot.handle = Some(handle);
            slot.config = Some(config.clone());
            slot.last_exit = None;
            slot.state = SupervisorState::Starting;
        }
        drop(ops);
        info!("Engine starting (pid {}, generation {})", pid, generation);

        match self.await_ready(generation, pid, config, &output, exit).await {
            Startup::Ready => {
                // The exit report is published before the watcher's exit
                // hook runs, so checking it under the slot lock closes the
                // window between the last probe and the transition.
                let exited = {
                    let mut slot = self.shared.slot();
                    if !slot.owned_by(generation) {
                        return Err(SupervisorError::StartCancelled);
                    }
                    match slot.handle.as_ref().and_then(ProcessHandle::exit_report) {
                        None => {
                            slot.state = SupervisorState::Running;
                            None
                        }
                        Some(report) => {
                            slot.state = SupervisorState::Failed;
                            slot.handle = None;
                            slot.config = None;
                            Some(report)
                        }
                    }
                };
                match exited {
                    None => {
                        info!("Engine running (pid {})", pid);
                        Ok(())
                    }
                    Some(report) => Err(SupervisorError::ExitedBeforeReady {
                        status: report.describe(),
                        diagnostic: output.render(),
                    }),
                }
            }
            Startup::Exited(report) => {
                if self.fail_start(generation).is_none() {
                    return Err(SupervisorError::StartCancelled);
                }
                warn!("Engine pid {} {} before becoming ready", pid, report.describe());
                Err(SupervisorError::ExitedBeforeReady {
                    status: report.describe(),
                    diagnostic: output.render(),
                })
            }
            Startup::TimedOut => {
                let Some(handle) = self.fail_start(generation) else {
                    return Err(SupervisorError::StartCancelled);
                };
                handle.terminate(false).await;
                warn!(
                    "Engine pid {} not ready after {:?}, killed",
                    pid, settings.startup_timeout
                );
                Err(SupervisorError::ReadinessTimeout {
                    timeout: settings.startup_timeout,
                    diagnostic: output.render(),
                })
            }
            Startup::Cancelled => {
                debug!("Start of engine pid {} cancelled", pid);
                Err(SupervisorError::StartCancelled)
            }
        }
    }

    /// Stop the engine.
    ///
    /// `graceful` sends SIGTERM and escalates to SIGKILL after the grace
    /// period; otherwise the process is killed immediately. Always ends in
    /// `Stopped`; a no-op when already stopped.
    pub async fn stop(&self, graceful: bool) -> Result<(), SupervisorError> {
        let _ops = self.shared.ops.lock().await;

        let handle = {
            let mut slot = self.shared.slot();
            match slot.state {
                SupervisorState::Stopped => return Ok(()),
                SupervisorState::Failed => {
                    slot.state = SupervisorState::Stopped;
                    slot.handle = None;
                    slot.config = None;
                    info!("Engine state: failed -> stopped");
                    return Ok(());
                }
                SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping => {
                    info!("Engine state: {} -> stopping", slot.state);
                    slot.state = SupervisorState::Stopping;
                    slot.handle.take()
                }
            }
        };

        if let Some(handle) = handle {
            let pid = handle.pid;
            let report = handle.terminate(graceful).await;
            info!("Engine pid {} stopped ({})", pid, report.describe());
        }

        let mut slot = self.shared.slot();
        slot.state = SupervisorState::Stopped;
        slot.config = None;
        Ok(())
    }

    fn transition(&self, to: SupervisorState) {
        let mut slot = self.shared.slot();
        if slot.state != to {
            debug!("Engine state: {} -> {}", slot.state, to);
            slot.state = to;
        }
    }

    fn check_can_start(&self) -> Result<(), SupervisorError> {
        let slot = self.shared.slot();
        if slot.state.can_start() {
            Ok(())
        } else {
            Err(SupervisorError::InvalidState {
                operation: "start",
                state: slot.state,
            })
        }
    }

    /// Move to `Failed` and take the handle, unless a stop already owns the
    /// process of `generation`.
    fn fail_start(&self, generation: u64) -> Option<ProcessHandle> {
        let mut slot = self.shared.slot();
        if !slot.owned_by(generation) {
            return None;
        }
        slot.state = SupervisorState::Failed;
        slot.config = None;
        slot.handle.take()
    }

    async fn await_ready(
        &self,
        generation: u64,
        pid: u32,
        config: &EngineConfig,
        output: &OutputLog,
        mut exit: watch::Receiver<Option<ExitReport>>,
    ) -> Startup {
        let settings = &self.shared.settings;
        let started = Instant::now();
        let deadline = started + settings.startup_timeout;

        loop {
            if !self.shared.slot().owned_by(generation) {
                return Startup::Cancelled;
            }
            if let Some(report) = exit.borrow_and_update().clone() {
                return Startup::Exited(report);
            }

            let ctx = ReadinessContext {
                pid,
                ports: config.ports(),
                output,
                elapsed: started.elapsed(),
            };
            if self.shared.readiness.is_ready(&ctx).await {
                if let Some(report) = exit.borrow().clone() {
                    return Startup::Exited(report);
                }
                return Startup::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return Startup::TimedOut;
            }
            let wait = settings.probe_interval.min(deadline - now);
            tokio::select! {
                changed = exit.changed() => {
                    if changed.is_err() && exit.borrow().is_none() {
                        // Watcher gone without a report; treat as exited.
                        return Startup::Exited(ExitReport {
                            code: None,
                            signal: None,
                            requested: false,
                            error: Some("watcher ended".to_string()),
                        });
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Dropping the handle drops its cancellation token, which makes the
        // watcher kill the process.
        if let Some(handle) = self.shared.slot().handle.take() {
            debug!("Supervisor dropped with live engine pid {}", handle.pid);
        }
    }
}

fn natural_exit_hook(shared: Weak<Shared>, generation: u64) -> handle::NaturalExit {
    Box::new(move |report: ExitReport| {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let event = {
            let mut slot = shared.slot();
            let ours = slot
                .handle
                .as_ref()
                .is_some_and(|h| h.generation == generation);
            if !(ours && slot.state == SupervisorState::Running) {
                // Starting is handled by `start`, Stopping by `stop`.
                return;
            }
            let handle = slot.handle.take();
            slot.state = SupervisorState::Failed;
            slot.config = None;
            let event = handle.map(|h| UnexpectedExit {
                generation,
                pid: h.pid,
                status: report.describe(),
                diagnostic: h.output.render(),
            });
            slot.last_exit = event.clone();
            event
        };

        if let Some(event) = event {
            warn!(
                "Engine pid {} {} unexpectedly; state: running -> failed",
                event.pid, event.status
            );
            if let Some(callback) = shared.callback() {
                callback(event);
            }
        }
    })
}
