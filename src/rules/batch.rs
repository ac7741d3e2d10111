//! A built batch: setup and cleanup steps plus the backend that produced them.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use super::backend::Backend;
use super::mode::{Platform, TransparentMode};
use crate::exec::Step;

/// Ordered setup steps and their matching cleanup, tagged with mode and platform.
///
/// Applying `cleanup` is safe whether `setup` ran fully, partially or not at
/// all: every cleanup step is guarded or tolerant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleBatch {
    /// Backend the steps were built from, including any captured host state.
    pub backend: Backend,
    /// Steps to apply, in order.
    pub setup: Vec<Step>,
    /// Steps that undo `setup`, in order.
    pub cleanup: Vec<Step>,
}

impl RuleBatch {
    /// The empty batch for [`TransparentMode::Disabled`].
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            setup: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    /// Mode the batch implements.
    pub fn mode(&self) -> TransparentMode {
        self.backend.mode()
    }

    /// Platform the batch targets, `None` when disabled.
    pub fn platform(&self) -> Option<Platform> {
        self.backend.platform()
    }

    /// Whether the batch issues no commands.
    pub fn is_empty(&self) -> bool {
        self.setup.is_empty() && self.cleanup.is_empty()
    }

    /// Human-readable listing of both sequences.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let platform = self
            .platform()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "any".to_string());
        let _ = writeln!(out, "# mode: {} (platform: {})", self.mode(), platform);
        for (title, steps) in [("setup", &self.setup), ("cleanup", &self.cleanup)] {
            let _ = writeln!(out, "# {}", title);
            if steps.is_empty() {
                let _ = writeln!(out, "#   (no commands)");
            }
            for (i, step) in steps.iter().enumerate() {
                let _ = writeln!(out, "# {}. {}", i + 1, step.description);
                let _ = writeln!(out, "{}", step.command);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PortSet;
    use crate::rules::backend::RuleBackend;
    use crate::rules::settings::RuleSettings;

    fn redirect_batch() -> RuleBatch {
        let backend = Backend::lookup(
            TransparentMode::Redirect,
            Platform::Linux,
            &PortSet::transparent(52345),
            &RuleSettings::default(),
        )
        .unwrap();
        RuleBatch {
            setup: backend.build_setup(),
            cleanup: backend.build_cleanup(),
            backend,
        }
    }

    #[test]
    fn test_render_lists_both_sequences() {
        let rendered = redirect_batch().render();
        assert!(rendered.starts_with("# mode: redirect (platform: linux)"));
        assert!(rendered.contains("# 1. create chain TP_RULE\niptables -w -t nat -N TP_RULE\n"));
        assert!(rendered.contains("# cleanup\n# 1. remove TP_RULE splice from OUTPUT"));
    }

    #[test]
    fn test_disabled_batch() {
        let batch = RuleBatch::disabled();
        assert!(batch.is_empty());
        assert_eq!(batch.mode(), TransparentMode::Disabled);
        assert_eq!(batch.platform(), None);
        assert!(batch.render().contains("(no commands)"));
    }

    #[test]
    fn test_batch_survives_json() {
        let batch = redirect_batch();
        let json = serde_json::to_string(&batch).unwrap();
        let back: RuleBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
