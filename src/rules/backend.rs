//! Backend selection: one tagged variant per (mode, platform) pair.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{RuleError, RuleResult};
use super::mode::{Platform, TransparentMode};
use super::redirect::Redirect;
use super::settings::RuleSettings;
use super::sysproxy::SystemProxy;
use super::tproxy::Tproxy;
use super::tun::Tun;
use crate::engine::PortSet;
use crate::exec::{CommandExecutor, Step};

/// Capability shared by every rule backend.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Read whatever host state the batches depend on.
    ///
    /// Runs before `build_setup` / `build_cleanup`. Most backends derive
    /// their batches from settings alone and keep the default no-op.
    async fn prepare(&mut self, _executor: &CommandExecutor) -> RuleResult<()> {
        Ok(())
    }

    /// Ordered setup steps.
    fn build_setup(&self) -> Vec<Step>;

    /// Ordered cleanup steps; each independently idempotent.
    fn build_cleanup(&self) -> Vec<Step>;

    /// Whether cleanup must be rebuilt from fresh host state instead of
    /// replaying the batch recorded at setup time.
    fn reenumerates_for_cleanup(&self) -> bool {
        false
    }
}

/// The backend behind a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum Backend {
    /// No rules at all.
    Disabled,
    /// `iptables -t nat` REDIRECT chain.
    LinuxRedirect(Redirect),
    /// `iptables -t mangle` TPROXY plus policy routing.
    LinuxTproxy(Tproxy),
    /// Tun interface carrying the default route.
    LinuxTun(Tun),
    /// `networksetup` per-service proxies.
    MacSystemProxy(SystemProxy),
}

impl Backend {
    /// Pick the backend for `mode` on `platform`, addressed at `ports`.
    pub fn lookup(
        mode: TransparentMode,
        platform: Platform,
        ports: &PortSet,
        settings: &RuleSettings,
    ) -> RuleResult<Self> {
        match (mode, platform) {
            (TransparentMode::Disabled, _) => Ok(Backend::Disabled),
            (TransparentMode::Redirect, Platform::Linux) => {
                let port = ports.transparent.ok_or(RuleError::MissingPort {
                    mode,
                    port: "transparent",
                })?;
                Ok(Backend::LinuxRedirect(Redirect::new(settings, port)))
            }
            (TransparentMode::Tproxy, Platform::Linux) => {
                let port = ports.transparent.ok_or(RuleError::MissingPort {
                    mode,
                    port: "transparent",
                })?;
                Ok(Backend::LinuxTproxy(Tproxy::new(settings, port)))
            }
            (TransparentMode::Tun, Platform::Linux) => Ok(Backend::LinuxTun(Tun::new(settings))),
            (TransparentMode::SystemProxy, Platform::MacOs) => {
                if ports.http.is_none() && ports.socks.is_none() {
                    return Err(RuleError::MissingPort {
                        mode,
                        port: "http or socks",
                    });
                }
                Ok(Backend::MacSystemProxy(SystemProxy::new(settings, ports)))
            }
            (mode, platform) => Err(RuleError::PlatformUnsupported { mode, platform }),
        }
    }

    /// Mode this backend implements.
    pub fn mode(&self) -> TransparentMode {
        match self {
            Backend::Disabled => TransparentMode::Disabled,
            Backend::LinuxRedirect(_) => TransparentMode::Redirect,
            Backend::LinuxTproxy(_) => TransparentMode::Tproxy,
            Backend::LinuxTun(_) => TransparentMode::Tun,
            Backend::MacSystemProxy(_) => TransparentMode::SystemProxy,
        }
    }

    /// Platform this backend runs on. `None` for `Disabled`.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            Backend::Disabled => None,
            Backend::LinuxRedirect(_) | Backend::LinuxTproxy(_) | Backend::LinuxTun(_) => {
                Some(Platform::Linux)
            }
            Backend::MacSystemProxy(_) => Some(Platform::MacOs),
        }
    }

    fn inner(&self) -> Option<&dyn RuleBackend> {
        match self {
            Backend::Disabled => None,
            Backend::LinuxRedirect(b) => Some(b),
            Backend::LinuxTproxy(b) => Some(b),
            Backend::LinuxTun(b) => Some(b),
            Backend::MacSystemProxy(b) => Some(b),
        }
    }

    fn inner_mut(&mut self) -> Option<&mut dyn RuleBackend> {
        match self {
            Backend::Disabled => None,
            Backend::LinuxRedirect(b) => Some(b),
            Backend::LinuxTproxy(b) => Some(b),
            Backend::LinuxTun(b) => Some(b),
            Backend::MacSystemProxy(b) => Some(b),
        }
    }
}

#[async_trait]
impl RuleBackend for Backend {
    async fn prepare(&mut self, executor: &CommandExecutor) -> RuleResult<()> {
        match self.inner_mut() {
            Some(backend) => backend.prepare(executor).await,
            None => Ok(()),
        }
    }

    fn build_setup(&self) -> Vec<Step> {
        self.inner().map(|b| b.build_setup()).unwrap_or_default()
    }

    fn build_cleanup(&self) -> Vec<Step> {
        self.inner().map(|b| b.build_cleanup()).unwrap_or_default()
    }

    fn reenumerates_for_cleanup(&self) -> bool {
        self.inner().is_some_and(|b| b.reenumerates_for_cleanup())
    }
}
