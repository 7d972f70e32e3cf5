//! Tunables recognized by the engine (spec §6).
//!
//! No file format is mandated here — the relational metadata schema and the
//! administrative surface that would load this are out of scope — but the
//! struct derives `serde` so a host binary can hang whatever config format it
//! likes off of it, the same way `config/datastore.rs` keeps its schema as a
//! plain serializable shape behind a section-config plugin.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed chunk size for new uploads, in bytes.
    pub chunk_size: u64,
    /// Minimum replica count per primary chunk.
    pub min_replicas: usize,
    /// Reject uploads unless at least this many nodes are currently available.
    pub min_available_nodes_for_upload: usize,
    /// Node monitor loop period, in seconds.
    pub monitor_interval_secs: u64,
    /// Placement load-stats cache freshness, in seconds.
    pub load_stats_ttl_secs: u64,
    /// Give-up threshold per `PendingReplication` row.
    pub pending_max_attempts: u32,
    /// Files at or above this size are never whole-file cached, in bytes.
    pub cache_file_max_size: u64,
    /// Whole-file cache entry TTL, in seconds.
    pub cache_file_ttl_secs: u64,
    /// Access-counter TTL, in seconds.
    pub access_count_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,
            min_replicas: 1,
            min_available_nodes_for_upload: 3,
            monitor_interval_secs: 60,
            load_stats_ttl_secs: 60,
            pending_max_attempts: 5,
            cache_file_max_size: 50 * 1024 * 1024,
            cache_file_ttl_secs: 3600,
            access_count_ttl_secs: 86_400,
        }
    }
}

impl Config {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn load_stats_ttl(&self) -> Duration {
        Duration::from_secs(self.load_stats_ttl_secs)
    }

    pub fn cache_file_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_file_ttl_secs)
    }

    pub fn access_count_ttl(&self) -> Duration {
        Duration::from_secs(self.access_count_ttl_secs)
    }
}
