//! Sequential batch execution with per-step reporting.
//!
//! Two failure policies exist and the asymmetry between them is part of the
//! contract:
//!
//! - [`FailurePolicy::Abort`] (setup): stop at the first failing step. Later
//!   steps depend on earlier ones (a rule cannot reference a chain that was
//!   never created).
//! - [`FailurePolicy::Continue`] (cleanup): attempt every step and collect
//!   failures. A cleanup that gives up halfway leaves more state behind than
//!   one that keeps going.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::command::{CommandLine, Step};
use super::error::ExecError;
use super::runner::{CommandOutput, CommandRunner};

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failure.
    Abort,
    /// Keep going and report every failure.
    Continue,
}

/// A step that failed, with the failing command and captured diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Position of the step in its batch.
    pub index: usize,
    /// Step description.
    pub description: String,
    /// Rendered command line.
    pub command: String,
    /// Captured stderr/stdout, or the spawn/timeout reason.
    pub diagnostic: String,
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// The command ran and succeeded.
    Done,
    /// The guard said nothing needed doing.
    Skipped,
    /// The command failed with a tolerated message.
    Tolerated,
    /// The command failed.
    Failed(StepFailure),
}

/// Per-step record in a [`BatchReport`].
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Step description.
    pub description: String,
    /// Rendered command line.
    pub command: String,
    /// What happened.
    pub status: StepStatus,
    /// Captured output, when the command ran to completion.
    pub output: Option<CommandOutput>,
}

/// Result of running a batch.
///
/// Under [`FailurePolicy::Abort`] the report ends at the failing step; steps
/// after it were never attempted and do not appear.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per attempted step, in order.
    pub results: Vec<StepResult>,
}

impl BatchReport {
    /// Whether no step failed.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Failed steps, in order.
    pub fn failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.results.iter().filter_map(|r| match &r.status {
            StepStatus::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    /// Commands that completed without failing (run, skipped or tolerated).
    pub fn completed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !matches!(r.status, StepStatus::Failed(_)))
            .map(|r| r.command.clone())
            .collect()
    }

    /// Number of steps whose command actually ran successfully.
    pub fn executed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == StepStatus::Done)
            .count()
    }
}

/// Runs batches of [`Step`]s through a [`CommandRunner`].
#[derive(Clone)]
pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Create an executor with a per-command timeout.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a read-only query (used by backends that inspect host state).
    pub async fn query(&self, command: &CommandLine) -> Result<CommandOutput, ExecError> {
        self.runner.run(command, self.timeout).await
    }

    /// Run `steps` in order under the given policy.
    pub async fn run_batch(&self, steps: &[Step], policy: FailurePolicy) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, step) in steps.iter().enumerate() {
            let result = self.run_step(index, step).await;
            let failed = matches!(result.status, StepStatus::Failed(_));
            report.results.push(result);

            if failed && policy == FailurePolicy::Abort {
                debug!(
                    "Aborting batch after step {} of {}",
                    index + 1,
                    steps.len()
                );
                break;
            }
        }

        report
    }

    async fn run_step(&self, index: usize, step: &Step) -> StepResult {
        let command = step.command.to_string();

        if let Some(guard) = &step.guard {
            let probe = guard.probe();
            match self.runner.run(&probe.command, self.timeout).await {
                Ok(output) => {
                    if !guard.should_run(probe.matches(&output)) {
                        debug!("Skipping step '{}': nothing to do", step.description);
                        return StepResult {
                            description: step.description.clone(),
                            command,
                            status: StepStatus::Skipped,
                            output: None,
                        };
                    }
                }
                Err(e) => {
                    // Unknown state: attempt the step and let it speak for itself.
                    debug!("Guard probe for '{}' failed: {}", step.description, e);
                }
            }
        }

        match self.runner.run(&step.command, self.timeout).await {
            Ok(output) if output.success() => StepResult {
                description: step.description.clone(),
                command,
                status: StepStatus::Done,
                output: Some(output),
            },
            Ok(output) if step.is_tolerated(&output) => {
                debug!(
                    "Step '{}' failed with tolerated output: {}",
                    step.description,
                    output.diagnostic()
                );
                StepResult {
                    description: step.description.clone(),
                    command,
                    status: StepStatus::Tolerated,
                    output: Some(output),
                }
            }
            Ok(output) => {
                warn!(
                    "Step '{}' failed: `{}`: {}",
                    step.description,
                    command,
                    output.diagnostic()
                );
                StepResult {
                    description: step.description.clone(),
                    status: StepStatus::Failed(StepFailure {
                        index,
                        description: step.description.clone(),
                        command: command.clone(),
                        diagnostic: output.diagnostic(),
                    }),
                    command,
                    output: Some(output),
                }
            }
            Err(e) => {
                warn!("Step '{}' could not run: {}", step.description, e);
                StepResult {
                    description: step.description.clone(),
                    status: StepStatus::Failed(StepFailure {
                        index,
                        description: step.description.clone(),
                        command: command.clone(),
                        diagnostic: e.to_string(),
                    }),
                    command,
                    output: None,
                }
            }
        }
    }
}
