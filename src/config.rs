//! Runtime configuration.
//!
//! The two disable-reason lists are part of the regulatory contract; keep
//! their membership in sync with the machine's disable registry.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::egm::DisableReason;

/// Lockup applied by the controller while a transfer is in flight.
pub const EFT_TRANSFER_LOCKUP: &str = "eft-transfer-in-progress";

/// Disable reasons that never block a transfer.
pub const DEFAULT_NON_BLOCKING_CONDITIONS: &[&str] = &[
    EFT_TRANSFER_LOCKUP,
    "printer-paper-low",
    "note-acceptor-stacker-full",
    "idle-attract-mode",
];

/// Disable reasons attributable to the host or an offline communications link.
pub const DEFAULT_HOST_DISABLE_CONDITIONS: &[&str] = &[
    "host-disabled",
    "host-comms-offline",
    "progressive-host-offline",
    "validation-host-offline",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EftConfig {
    /// Deadline of each handshake phase.
    pub phase_timeout_ms: u64,
    pub non_blocking_conditions: Vec<DisableReason>,
    pub host_disable_conditions: Vec<DisableReason>,
    /// Highest credit balance a deposit may bring the machine to, in cents.
    pub max_credit_limit: u64,
}

impl EftConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for EftConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 800,
            non_blocking_conditions: DEFAULT_NON_BLOCKING_CONDITIONS
                .iter()
                .map(|id| DisableReason::new(*id))
                .collect(),
            host_disable_conditions: DEFAULT_HOST_DISABLE_CONDITIONS
                .iter()
                .map(|id| DisableReason::new(*id))
                .collect(),
            max_credit_limit: 1_000_000,
        }
    }
}
