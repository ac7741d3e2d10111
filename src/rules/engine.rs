//! Building, applying and cleaning rule batches.

use tracing::{debug, info, warn};

use super::backend::{Backend, RuleBackend};
use super::batch::RuleBatch;
use super::error::{RuleError, RuleResult};
use super::mode::{Platform, TransparentMode};
use super::settings::RuleSettings;
use crate::engine::PortSet;
use crate::exec::{CommandExecutor, FailurePolicy};

/// Builds batches for the host platform and runs them through an executor.
///
/// The engine never touches host state outside [`RuleEngine::apply`] and
/// [`RuleEngine::clean`], and keeps no record of what is applied; that is
/// the coordinator's job.
#[derive(Clone)]
pub struct RuleEngine {
    executor: CommandExecutor,
    settings: RuleSettings,
    platform: Platform,
}

impl RuleEngine {
    /// Create an engine for the detected platform.
    pub fn new(executor: CommandExecutor, settings: RuleSettings) -> Self {
        Self::with_platform(executor, settings, Platform::detect())
    }

    /// Create an engine for an explicit platform.
    pub fn with_platform(
        executor: CommandExecutor,
        settings: RuleSettings,
        platform: Platform,
    ) -> Self {
        Self {
            executor,
            settings,
            platform,
        }
    }

    /// Platform batches are built for.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Rule settings.
    pub fn settings(&self) -> &RuleSettings {
        &self.settings
    }

    /// Build the batch for `mode` addressed at `ports` on this engine's platform.
    pub async fn build_batch(&self, mode: TransparentMode, ports: &PortSet) -> RuleResult<RuleBatch> {
        self.build_batch_for(mode, ports, self.platform).await
    }

    /// Build the batch for `mode` addressed at `ports` on `platform`.
    ///
    /// Backends that depend on host state (the current default route, the
    /// list of network services) read it here.
    pub async fn build_batch_for(
        &self,
        mode: TransparentMode,
        ports: &PortSet,
        platform: Platform,
    ) -> RuleResult<RuleBatch> {
        let mut backend = Backend::lookup(mode, platform, ports, &self.settings)?;
        backend.prepare(&self.executor).await?;

        let batch = RuleBatch {
            setup: backend.build_setup(),
            cleanup: backend.build_cleanup(),
            backend,
        };
        debug!(
            "Built {} batch: {} setup step(s), {} cleanup step(s)",
            mode,
            batch.setup.len(),
            batch.cleanup.len()
        );
        Ok(batch)
    }

    /// Apply the setup sequence, stopping at the first failing step.
    ///
    /// On failure the steps before the failing one remain applied; callers
    /// remediate with [`RuleEngine::clean`].
    pub async fn apply(&self, batch: &RuleBatch) -> RuleResult<()> {
        let mode = batch.mode();
        if batch.setup.is_empty() {
            debug!("No setup steps for {} rules", mode);
            return Ok(());
        }

        let report = self
            .executor
            .run_batch(&batch.setup, FailurePolicy::Abort)
            .await;

        if let Some(failure) = report.failures().next() {
            return Err(RuleError::Apply {
                mode,
                step: failure.description.clone(),
                command: failure.command.clone(),
                diagnostic: failure.diagnostic.clone(),
                completed: report.completed(),
            });
        }

        info!(
            "Applied {} rules ({} of {} step(s) executed)",
            mode,
            report.executed(),
            batch.setup.len()
        );
        Ok(())
    }

    /// Run the cleanup sequence, attempting every step.
    ///
    /// Backends whose targets change over time rebuild cleanup from fresh
    /// host state; if that fails the recorded cleanup is used instead.
    pub async fn clean(&self, batch: &RuleBatch) -> RuleResult<()> {
        let mode = batch.mode();

        let refreshed = if batch.backend.reenumerates_for_cleanup() {
            let mut backend = batch.backend.clone();
            match backend.prepare(&self.executor).await {
                Ok(()) => Some(backend.build_cleanup()),
                Err(e) => {
                    warn!("Re-enumeration for {} cleanup failed, using recorded steps: {}", mode, e);
                    None
                }
            }
        } else {
            None
        };
        let steps = refreshed.as_deref().unwrap_or(&batch.cleanup);

        if steps.is_empty() {
            debug!("No cleanup steps for {} rules", mode);
            return Ok(());
        }

        let report = self.executor.run_batch(steps, FailurePolicy::Continue).await;
        let failures: Vec<_> = report.failures().cloned().collect();
        if !failures.is_empty() {
            return Err(RuleError::Cleanup { mode, failures });
        }

        info!(
            "Cleaned {} rules ({} of {} step(s) executed)",
            mode,
            report.executed(),
            steps.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(host: &Arc<FakeHost>, platform: Platform) -> RuleEngine {
        let executor = CommandExecutor::new(host.clone(), Duration::from_secs(1));
        RuleEngine::with_platform(executor, RuleSettings::default(), platform)
    }

    fn all_ports() -> PortSet {
        PortSet {
            transparent: Some(52345),
            http: Some(8080),
            socks: Some(1080),
        }
    }

    #[tokio::test]
    async fn test_redirect_scenario() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, Platform::Linux);

        let batch = engine
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap();

        let setup: Vec<&str> = batch.setup.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            setup,
            vec![
                "create chain TP_RULE",
                "redirect TCP to port 52345",
                "splice TP_RULE into OUTPUT",
            ]
        );
        let cleanup: Vec<&str> = batch.cleanup.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            cleanup,
            vec![
                "remove TP_RULE splice from OUTPUT",
                "delete TCP redirect rule",
                "delete chain TP_RULE",
            ]
        );
        assert!(host.history().is_empty(), "building must not touch the host");
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        for mode in [
            TransparentMode::Redirect,
            TransparentMode::Tproxy,
            TransparentMode::Tun,
        ] {
            let host = Arc::new(FakeHost::new());
            host.set_default_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100");
            let engine = engine(&host, Platform::Linux);
            let batch = engine.build_batch(mode, &all_ports()).await.unwrap();

            engine.apply(&batch).await.unwrap();
            let once = host.snapshot();
            engine.apply(&batch).await.unwrap();
            assert_eq!(host.snapshot(), once, "{} applied twice", mode);
        }
    }

    #[tokio::test]
    async fn test_apply_then_clean_round_trips() {
        for mode in [
            TransparentMode::Redirect,
            TransparentMode::Tproxy,
            TransparentMode::Tun,
        ] {
            let host = Arc::new(FakeHost::new());
            host.set_default_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100");
            let before = host.snapshot();
            let engine = engine(&host, Platform::Linux);
            let batch = engine.build_batch(mode, &all_ports()).await.unwrap();

            engine.apply(&batch).await.unwrap();
            assert_ne!(host.snapshot(), before, "{} changed nothing", mode);
            engine.clean(&batch).await.unwrap();
            assert_eq!(host.snapshot(), before, "{} did not round-trip", mode);
        }
    }

    #[tokio::test]
    async fn test_clean_never_applied_batch_succeeds() {
        for mode in [
            TransparentMode::Redirect,
            TransparentMode::Tproxy,
            TransparentMode::Tun,
        ] {
            let host = Arc::new(FakeHost::new());
            host.set_default_route("default via 192.168.1.1 dev eth0");
            let before = host.snapshot();
            let engine = engine(&host, Platform::Linux);
            let batch = engine.build_batch(mode, &all_ports()).await.unwrap();

            engine.clean(&batch).await.unwrap();
            engine.clean(&batch).await.unwrap();
            assert_eq!(host.snapshot(), before);
        }
    }

    #[tokio::test]
    async fn test_redirect_chain_lifecycle() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, Platform::Linux);
        let batch = engine
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap();

        engine.apply(&batch).await.unwrap();
        let applied = host.snapshot();
        assert!(applied.has_chain("nat", "TP_RULE"));
        assert!(applied.has_rule("nat", "OUTPUT", "-j TP_RULE"));

        engine.clean(&batch).await.unwrap();
        let cleaned = host.snapshot();
        assert!(!cleaned.has_chain("nat", "TP_RULE"));
        assert!(!cleaned.has_rule("nat", "OUTPUT", "-j TP_RULE"));
    }

    #[tokio::test]
    async fn test_apply_failure_reports_completed_steps() {
        let host = Arc::new(FakeHost::new());
        host.fail_matching("-A OUTPUT -j TP_RULE");
        let engine = engine(&host, Platform::Linux);
        let batch = engine
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap();

        match engine.apply(&batch).await {
            Err(RuleError::Apply {
                step, completed, ..
            }) => {
                assert_eq!(step, "splice TP_RULE into OUTPUT");
                assert_eq!(completed.len(), 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        host.clear_failures();
        engine.clean(&batch).await.unwrap();
        assert!(!host.snapshot().has_chain("nat", "TP_RULE"));
    }

    #[tokio::test]
    async fn test_tun_partial_failure_restores_default_route() {
        let host = Arc::new(FakeHost::new());
        host.set_default_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100");
        let before = host.snapshot();
        host.fail_matching("link set dev tp0 up");
        let engine = engine(&host, Platform::Linux);

        let batch = engine
            .build_batch(TransparentMode::Tun, &PortSet::default())
            .await
            .unwrap();
        assert_eq!(batch.setup.len(), 3);

        let err = engine.apply(&batch).await.unwrap_err();
        assert!(matches!(err, RuleError::Apply { ref step, .. } if step == "bring tp0 up"));

        engine.clean(&batch).await.unwrap();
        assert_eq!(host.snapshot(), before);
    }

    #[tokio::test]
    async fn test_tun_restores_replaced_default_route() {
        let host = Arc::new(FakeHost::new());
        // Same metric as the tun route, so setup replaces it outright.
        host.set_default_route("default via 10.0.0.1 dev wlan0");
        let before = host.snapshot();
        let engine = engine(&host, Platform::Linux);

        let batch = engine
            .build_batch(TransparentMode::Tun, &PortSet::default())
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();
        assert!(host.snapshot().default_routes().iter().all(|r| r.contains("dev tp0")));

        engine.clean(&batch).await.unwrap();
        assert_eq!(host.snapshot(), before);
    }

    #[tokio::test]
    async fn test_clean_collects_every_failure() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, Platform::Linux);
        let batch = engine
            .build_batch(TransparentMode::Tproxy, &PortSet::transparent(52345))
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();

        host.fail_matching("-D OUTPUT -j TP_MARK");
        host.fail_matching("rule del fwmark");
        match engine.clean(&batch).await {
            Err(RuleError::Cleanup { failures, .. }) => {
                // TP_MARK is still referenced from OUTPUT, so `-X` fails too.
                let indices: Vec<usize> = failures.iter().map(|f| f.index).collect();
                assert_eq!(indices, vec![0, 2, 5]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Steps after the failures were still attempted.
        let snapshot = host.snapshot();
        assert!(!snapshot.has_rule("mangle", "PREROUTING", "-j TP_RULE"));
        assert!(snapshot.has_chain("mangle", "TP_MARK"));
        assert!(!snapshot.has_chain("mangle", "TP_RULE"));
    }

    #[tokio::test]
    async fn test_system_proxy_cleanup_reenumerates() {
        let host = Arc::new(FakeHost::new());
        host.add_service("Wi-Fi");
        host.add_service("Thunderbolt Bridge");
        let engine = engine(&host, Platform::MacOs);

        let batch = engine
            .build_batch(TransparentMode::SystemProxy, &all_ports())
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();
        assert_eq!(
            host.snapshot().proxy("Wi-Fi", "web").as_deref(),
            Some("127.0.0.1:8080")
        );

        // A service appears after setup and one disappears.
        host.remove_service("Thunderbolt Bridge");
        host.add_service("USB LAN");
        engine.clean(&batch).await.unwrap();

        let after = host.snapshot();
        assert_eq!(after.proxy("Wi-Fi", "web"), None);
        assert_eq!(after.proxy("Wi-Fi", "socks"), None);
        let history = host.history().join("\n");
        assert!(history.contains("-setwebproxystate 'USB LAN' off"));
        assert!(!history.contains("-setwebproxystate 'Thunderbolt Bridge' off"));
    }

    #[tokio::test]
    async fn test_system_proxy_cleanup_falls_back_to_recorded_steps() {
        let host = Arc::new(FakeHost::new());
        host.add_service("Wi-Fi");
        let engine = engine(&host, Platform::MacOs);
        let batch = engine
            .build_batch(TransparentMode::SystemProxy, &all_ports())
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();

        host.fail_matching("-listallnetworkservices");
        engine.clean(&batch).await.unwrap();
        assert_eq!(host.snapshot().proxy("Wi-Fi", "web"), None);
    }

    #[tokio::test]
    async fn test_disabled_issues_no_commands() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, Platform::Other);
        let batch = engine
            .build_batch(TransparentMode::Disabled, &PortSet::default())
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();
        engine.clean(&batch).await.unwrap();
        assert!(host.history().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, Platform::MacOs);
        let err = engine
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::PlatformUnsupported { .. }));
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn test_redirect_against_kernel() {
        let executor = CommandExecutor::new(
            Arc::new(crate::exec::SystemRunner),
            Duration::from_secs(5),
        );
        let engine = RuleEngine::with_platform(executor, RuleSettings::default(), Platform::Linux);
        let batch = engine
            .build_batch(TransparentMode::Redirect, &PortSet::transparent(52345))
            .await
            .unwrap();
        engine.apply(&batch).await.unwrap();
        engine.apply(&batch).await.unwrap();
        engine.clean(&batch).await.unwrap();
        engine.clean(&batch).await.unwrap();
    }
}
