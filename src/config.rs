use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::retry::RetryPolicy;

pub const DEFAULT_EXTENSION_ID: &str = "universal-immersion-engine";

/// Timings and limits of the persistence engine.
///
/// The slop tolerance and the auto-backup interval were picked empirically;
/// they live here so they can be tuned without touching the logic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub extension_id: String,
    /// How long to wait for the host to hydrate its settings store.
    pub init_grace_ms: u64,
    /// A mirror must be newer than the live document by more than this to win.
    pub staleness_slop_ms: u64,
    pub persist_retry_ms: u64,
    pub chat_poll_ms: u64,
    pub watchdog_interval_ms: u64,
    pub watchdog_first_check_ms: u64,
    pub recover_min_interval_ms: u64,
    pub auto_backup_interval_ms: u64,
    pub max_backups: usize,
    pub flc_quota_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
            init_grace_ms: 30_000,
            staleness_slop_ms: 250,
            persist_retry_ms: 1_000,
            chat_poll_ms: 1_000,
            watchdog_interval_ms: 1_500,
            watchdog_first_check_ms: 1_000,
            recover_min_interval_ms: 2_500,
            auto_backup_interval_ms: 45_000,
            max_backups: 20,
            flc_quota_bytes: 5 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn chat_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chat_poll_ms.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    /// Single delayed retry used when the host context is not up yet.
    pub fn flush_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(1, self.persist_retry_ms)
    }
}

/// Root of everything the engine keeps on disk (`~/.uie`).
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".uie"))
}

/// Load the engine config from `path`. Missing or unreadable files yield `None`.
pub fn load_config_from(path: &std::path::Path) -> Option<EngineConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("ignoring unparsable config {}: {e}", path.display());
            None
        }
    }
}

pub fn save_config_to(path: &std::path::Path, config: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}
