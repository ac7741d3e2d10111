//! Readiness signals that flip `Starting` to `Running`.
//!
//! The supervisor polls a [`ReadinessCheck`] every probe interval until it
//! reports ready, the process exits, or the startup timeout elapses.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

use super::output::OutputLog;
use crate::engine::PortSet;

/// What a readiness check can look at.
#[derive(Debug)]
pub struct ReadinessContext<'a> {
    /// Engine pid.
    pub pid: u32,
    /// Ports the engine should bind.
    pub ports: &'a PortSet,
    /// Captured output so far.
    pub output: &'a OutputLog,
    /// Time since launch.
    pub elapsed: Duration,
}

/// Decides whether a freshly started engine is ready to receive traffic.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Whether the engine is ready now.
    async fn is_ready(&self, ctx: &ReadinessContext<'_>) -> bool;
}

/// Closures work as checks.
#[async_trait]
impl<F> ReadinessCheck for F
where
    F: Fn(&ReadinessContext<'_>) -> bool + Send + Sync,
{
    async fn is_ready(&self, ctx: &ReadinessContext<'_>) -> bool {
        self(ctx)
    }
}

/// Ready once every listening port accepts a TCP connection on loopback.
///
/// An engine without ports is ready once it has stayed alive for
/// `min_alive`.
#[derive(Debug, Clone)]
pub struct PortsListening {
    /// Settle time for engines without ports.
    pub min_alive: Duration,
    /// Per-connection attempt timeout.
    pub connect_timeout: Duration,
}

impl PortsListening {
    /// Check with the given settle time for port-less engines.
    pub fn new(min_alive: Duration) -> Self {
        Self {
            min_alive,
            connect_timeout: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl ReadinessCheck for PortsListening {
    async fn is_ready(&self, ctx: &ReadinessContext<'_>) -> bool {
        let ports = ctx.ports.listening();
        if ports.is_empty() {
            return ctx.elapsed >= self.min_alive;
        }
        for port in ports {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {}
                _ => {
                    trace!("Engine pid {} not yet listening on {}", ctx.pid, addr);
                    return false;
                }
            }
        }
        true
    }
}

/// Ready once a captured output line contains the pattern.
#[derive(Debug, Clone)]
pub struct LogLineMatch(pub String);

#[async_trait]
impl ReadinessCheck for LogLineMatch {
    async fn is_ready(&self, ctx: &ReadinessContext<'_>) -> bool {
        ctx.output.contains(&self.0)
    }
}
