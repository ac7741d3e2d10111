//! Transparent modes and host platforms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Strategy for steering unmodified application traffic into the engine.
///
/// At most one mode is active at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransparentMode {
    /// No OS rules.
    #[default]
    Disabled,
    /// Packet-filter redirect of outbound TCP (and optionally UDP).
    Redirect,
    /// TPROXY interception with mark-based policy routing.
    Tproxy,
    /// Virtual network interface carrying the default route.
    Tun,
    /// Per-service proxy settings.
    SystemProxy,
}

impl TransparentMode {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransparentMode::Disabled => "disabled",
            TransparentMode::Redirect => "redirect",
            TransparentMode::Tproxy => "tproxy",
            TransparentMode::Tun => "tun",
            TransparentMode::SystemProxy => "system_proxy",
        }
    }
}

impl fmt::Display for TransparentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransparentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(TransparentMode::Disabled),
            "redirect" => Ok(TransparentMode::Redirect),
            "tproxy" => Ok(TransparentMode::Tproxy),
            "tun" => Ok(TransparentMode::Tun),
            "system_proxy" | "system-proxy" | "systemproxy" => Ok(TransparentMode::SystemProxy),
            other => Err(format!(
                "unknown transparent mode '{}' (expected disabled, redirect, tproxy, tun or system_proxy)",
                other
            )),
        }
    }
}

/// Operating-system family, which decides the available rule backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Linux: netfilter and iproute2.
    Linux,
    /// macOS: per-service settings through `networksetup`.
    #[serde(rename = "macos")]
    MacOs,
    /// Anything else.
    Other,
}

impl Platform {
    /// Platform this binary was built for.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Other => "an unsupported platform",
        })
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::MacOs),
            other => Err(format!("unknown platform '{}' (expected linux or macos)", other)),
        }
    }
}
