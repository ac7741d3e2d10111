//! proxy-warden: local proxy supervisor and transparent routing controller.
//!
//! This crate runs an external proxy engine (xray, sing-box, ...) from an
//! already-materialized config file and installs the host rules that steer
//! traffic into it.
//!
//! # Safety Model
//!
//! The model is **no dangling redirection**: rules are applied only after the
//! engine listens, removed before it is stopped, and removed automatically
//! when it dies. Every change is serialized through one coordinator.
//!
//! # Architecture
//!
//! - **Supervisor**: spawns the engine, probes readiness, watches for exit
//! - **Rules**: idempotent setup/cleanup batches per transparent mode
//! - **Exec**: the command-runner seam and batch executor
//! - **Coordinator**: sequences the two and records what is applied
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: structured syslog audit trail

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod exec;
pub mod orchestrator;
pub mod rules;
pub mod supervisor;
pub mod telemetry;
pub mod testing;
