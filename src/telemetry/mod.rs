//! Audit logging for proxy-warden.
//!
//! Every change to the engine process or to the host's redirection rules is
//! recorded as a structured event in syslog with the `PROXY_WARDEN` tag.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): lifecycle and rule events, never stdout/stderr
//! - **Debug logging** (tracing): development logs go to stderr via `tracing`
//!
//! The logger is an explicit value. The binary creates one at startup and
//! hands an `Arc<AuditLogger>` to the coordinator; tests use
//! [`AuditLogger::new_null`].
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"rules_applied","mode":"redirect","platform":"linux","steps":3}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, CleanupTrigger};
pub use syslog::{AuditLogger, SYSLOG_TAG};
