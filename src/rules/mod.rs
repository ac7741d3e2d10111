//! OS rule batches for each transparent mode.
//!
//! A [`RuleBatch`] is built by [`RuleEngine::build_batch`] from a
//! [`TransparentMode`], the engine's [`PortSet`](crate::engine::PortSet) and
//! the host [`Platform`]. Each (mode, platform) pair maps to one [`Backend`]
//! variant:
//!
//! | Mode          | Platform | Backend                         |
//! |---------------|----------|---------------------------------|
//! | `disabled`    | any      | empty batch                     |
//! | `redirect`    | linux    | `iptables -t nat` REDIRECT      |
//! | `tproxy`      | linux    | `iptables -t mangle` TPROXY + `ip rule` |
//! | `tun`         | linux    | `ip tuntap` + default route     |
//! | `system_proxy`| macos    | `networksetup` per service      |

pub mod backend;
pub mod batch;
pub mod engine;
pub mod error;
mod iptables;
pub mod mode;
pub mod redirect;
pub mod settings;
pub mod sysproxy;
pub mod tproxy;
pub mod tun;

pub use backend::{Backend, RuleBackend};
pub use batch::RuleBatch;
pub use engine::RuleEngine;
pub use error::{RuleError, RuleResult};
pub use mode::{Platform, TransparentMode};
pub use settings::RuleSettings;
