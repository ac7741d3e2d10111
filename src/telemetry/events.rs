//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `PROXY_WARDEN` tag so that
//! every change to the host's routing is traceable after the fact.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for the routing controller.
///
/// Each variant records a change to the engine process or to the host's
/// packet-redirection rules.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Engine process became ready.
    EngineStarted {
        /// Engine process id.
        pid: u32,
        /// Supervisor generation of the process.
        generation: u64,
        /// Materialized config path handed to the engine.
        config: String,
    },

    /// Engine process failed to start or become ready.
    EngineStartFailed {
        /// Stable error kind.
        kind: String,
        /// Human-readable reason, including captured output.
        reason: String,
    },

    /// Engine process stopped on request.
    EngineStopped {
        /// Engine process id, when one was live.
        pid: Option<u32>,
        /// Whether SIGTERM was tried before SIGKILL.
        graceful: bool,
    },

    /// Engine process exited on its own while running.
    EngineExited {
        /// Engine process id.
        pid: u32,
        /// Supervisor generation of the process.
        generation: u64,
        /// How it ended.
        status: String,
    },

    /// Rule batch applied.
    RulesApplied {
        /// Transparent mode.
        mode: String,
        /// Platform the batch targets.
        platform: String,
        /// Number of setup steps.
        steps: usize,
    },

    /// Rule batch failed to apply.
    RulesApplyFailed {
        /// Transparent mode.
        mode: String,
        /// Description of the failing step.
        step: String,
        /// Captured diagnostic output.
        diagnostic: String,
    },

    /// Rule batch cleaned.
    RulesCleaned {
        /// Transparent mode.
        mode: String,
        /// What triggered the cleanup.
        trigger: CleanupTrigger,
        /// Number of cleanup steps that failed.
        failures: usize,
    },

    /// Unreadable applied-rules journal moved aside.
    JournalDiscarded {
        /// Journal path.
        path: String,
        /// Where the unreadable content was moved.
        moved_to: String,
        /// Parse error.
        reason: String,
    },
}

/// Reasons a rule batch is cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTrigger {
    /// A new desired state replaced the applied one.
    Replace,
    /// Applying the batch failed part-way.
    ApplyFailed,
    /// The engine exited while rules pointed at it.
    EngineExited,
    /// Rules recorded by a previous run were found at startup.
    StaleJournal,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
