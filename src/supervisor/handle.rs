//! The live engine process and its exit watcher.
//!
//! The child is owned by the watcher task. The handle keeps the pid, the
//! cancellation token and the exit channel; it is never cloned.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::output::OutputLog;

/// Cancellation token states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Keep running.
    None,
    /// SIGTERM, then SIGKILL after the grace period.
    Graceful,
    /// SIGKILL now.
    Kill,
}

/// How the engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if killed by one.
    pub signal: Option<i32>,
    /// Whether the exit followed a stop request.
    pub requested: bool,
    /// Set when waiting on the process failed.
    pub error: Option<String>,
}

impl ExitReport {
    fn from_wait(result: std::io::Result<ExitStatus>, requested: bool) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
                requested,
                error: None,
            },
            Err(e) => Self {
                code: None,
                signal: None,
                requested,
                error: Some(e.to_string()),
            },
        }
    }

    /// Human-readable summary.
    pub fn describe(&self) -> String {
        match (self.code, self.signal, &self.error) {
            (Some(code), _, _) => format!("exited with status {}", code),
            (None, Some(signal), _) => match Signal::try_from(signal) {
                Ok(sig) => format!("killed by {}", sig),
                Err(_) => format!("killed by signal {}", signal),
            },
            (None, None, Some(error)) => format!("wait failed: {}", error),
            (None, None, None) => "exited".to_string(),
        }
    }
}

/// Live engine process. Exclusively owned by the supervisor.
#[derive(Debug)]
pub struct ProcessHandle {
    /// OS process id.
    pub pid: u32,
    /// Supervisor-wide sequence number of this process.
    pub generation: u64,
    /// Launch time.
    pub started_at: Instant,
    /// Captured output.
    pub output: OutputLog,
    cancel: watch::Sender<StopSignal>,
    exit: watch::Receiver<Option<ExitReport>>,
    _watcher: JoinHandle<()>,
}

impl ProcessHandle {
    /// Exit report, once the process has ended.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    /// Receiver that yields the exit report.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit.clone()
    }

    /// Issue the cancellation token and wait for the process to end.
    pub async fn terminate(self, graceful: bool) -> ExitReport {
        let signal = if graceful {
            StopSignal::Graceful
        } else {
            StopSignal::Kill
        };
        self.cancel.send_replace(signal);

        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(report) => report.clone().unwrap_or_else(|| ExitReport::from_wait(Err(lost()), true)),
            Err(_) => ExitReport::from_wait(Err(lost()), true),
        }
    }
}

fn lost() -> std::io::Error {
    std::io::Error::other("watcher ended without reporting")
}

/// Called by the watcher once a process ends without a stop request.
pub(crate) type NaturalExit = Box<dyn FnOnce(ExitReport) + Send>;

/// Take ownership of `child`, watch it, and return its handle.
pub(crate) fn launch(
    mut child: Child,
    generation: u64,
    output: OutputLog,
    grace: Duration,
    on_natural_exit: NaturalExit,
) -> ProcessHandle {
    let pid = child.id().unwrap_or_default();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(output.spawn_reader(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(output.spawn_reader(stderr, "stderr"));
    }

    let (cancel_tx, cancel_rx) = watch::channel(StopSignal::None);
    let (exit_tx, exit_rx) = watch::channel(None);

    let watcher = tokio::spawn(async move {
        let report = watch_process(child, cancel_rx, grace).await;

        // Let readers drain so diagnostics include the final lines.
        for reader in readers {
            let _ = tokio::time::timeout(Duration::from_millis(200), reader).await;
        }

        debug!("Engine pid {} {}", pid, report.describe());
        exit_tx.send_replace(Some(report.clone()));
        if !report.requested {
            on_natural_exit(report);
        }
    });

    ProcessHandle {
        pid,
        generation,
        started_at: Instant::now(),
        output,
        cancel: cancel_tx,
        exit: exit_rx,
        _watcher: watcher,
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Stop(StopSignal),
}

async fn stop_requested(cancel: &mut watch::Receiver<StopSignal>) -> StopSignal {
    match cancel.wait_for(|s| *s != StopSignal::None).await {
        Ok(signal) => *signal,
        // Handle dropped without a stop request: nobody owns the process.
        Err(_) => StopSignal::Kill,
    }
}

async fn watch_process(
    mut child: Child,
    mut cancel: watch::Receiver<StopSignal>,
    grace: Duration,
) -> ExitReport {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        signal = stop_requested(&mut cancel) => Outcome::Stop(signal),
    };

    match outcome {
        Outcome::Exited(status) => ExitReport::from_wait(status, false),
        Outcome::Stop(signal) => {
            let status = shut_down(&mut child, signal, grace, &mut cancel).await;
            ExitReport::from_wait(status, true)
        }
    }
}

async fn shut_down(
    child: &mut Child,
    signal: StopSignal,
    grace: Duration,
    cancel: &mut watch::Receiver<StopSignal>,
) -> std::io::Result<ExitStatus> {
    if signal == StopSignal::Graceful {
        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to engine pid {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to signal engine pid {}: {}", pid, e);
            }
        }

        let escalated = tokio::select! {
            status = child.wait() => return status,
            _ = tokio::time::sleep(grace) => false,
            _ = cancel.wait_for(|s| *s == StopSignal::Kill) => true,
        };
        if escalated {
            debug!("Forced kill requested during grace period");
        } else {
            warn!("Engine did not exit within {:?}, killing", grace);
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill engine: {}", e);
    }
    child.wait().await
}
