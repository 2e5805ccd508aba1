//! # Configuration
//!
//! Runtime settings for the bus and its endpoints. Kept serde-friendly so
//! hosting applications can embed them in their own config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Deadline applied by `ask` when the caller gives none.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 60;

/// Environment variable overriding the journal directory.
const STORAGE_ENV_VAR: &str = "AGORA_LOG_PATH";

/// Settings for a bus instance and the endpoints attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Directory for the day-partitioned message journal.
    /// `None` disables persistence.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Default reply deadline for request/response helpers, in seconds
    #[serde(default = "default_reply_timeout_secs")]
    pub default_reply_timeout_secs: u64,
}

fn default_reply_timeout_secs() -> u64 {
    DEFAULT_REPLY_TIMEOUT_SECS
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            default_reply_timeout_secs: DEFAULT_REPLY_TIMEOUT_SECS,
        }
    }
}

impl BusConfig {
    /// The journal directory with the environment override applied.
    pub fn resolved_storage_dir(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var(STORAGE_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        self.storage_dir.clone()
    }

    /// The default reply deadline as a [`Duration`].
    pub fn default_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.default_reply_timeout_secs)
    }
}
