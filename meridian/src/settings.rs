//! Per-index settings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Translog durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// fsync before acknowledging each operation.
    Request,
    /// fsync on an interval; a crash may lose the most recent window.
    Async,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Request
    }
}

/// Settings attached to an index at creation time. `number_of_shards` is
/// immutable for the index's lifetime; the rest can be updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    #[serde(default)]
    pub number_of_replicas: u32,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default)]
    pub translog_durability: Durability,
    /// fsync interval for `Durability::Async`.
    #[serde(default = "default_translog_sync_interval_ms")]
    pub translog_sync_interval_ms: u64,
    /// Roll the translog generation past this many bytes.
    #[serde(default = "default_translog_flush_threshold")]
    pub translog_flush_threshold_bytes: u64,
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_translog_sync_interval_ms() -> u64 {
    5000
}

fn default_translog_flush_threshold() -> u64 {
    512 * 1024 * 1024
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 0,
            refresh_interval_ms: default_refresh_interval_ms(),
            translog_durability: Durability::default(),
            translog_sync_interval_ms: default_translog_sync_interval_ms(),
            translog_flush_threshold_bytes: default_translog_flush_threshold(),
        }
    }
}

impl IndexSettings {
    pub fn with_shards(shards: u32, replicas: u32) -> Self {
        Self {
            number_of_shards: shards,
            number_of_replicas: replicas,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_shards == 0 {
            return Err(Error::Validation(
                "number_of_shards must be at least 1".to_string(),
            ));
        }
        if self.refresh_interval_ms == 0 {
            return Err(Error::Validation(
                "refresh_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
