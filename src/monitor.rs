//! `NodeMonitor` (spec §4, §5): periodic availability checks, primary
//! election and a freshness-bounded load-stats cache.
//!
//! Grounded on `node_manager.py`'s module-level `_load_stats_cache` (a
//! 60-second TTL dict keyed by node id). The single-flight refresh here uses
//! a held `tokio::sync::Mutex` instead of a bare dict + timestamp, so two
//! callers racing a cache miss don't both hit every node's backend at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Copy)]
pub struct LoadStats {
    pub chunk_count: u64,
    pub available: bool,
}

struct CachedStats {
    stats: HashMap<NodeId, LoadStats>,
    refreshed_at: Instant,
}

pub struct NodeMonitor {
    registry: Arc<NodeRegistry>,
    metadata: Arc<dyn MetadataStore>,
    config: Config,
    cache: AsyncMutex<Option<CachedStats>>,
}

impl NodeMonitor {
    pub fn new(registry: Arc<NodeRegistry>, metadata: Arc<dyn MetadataStore>, config: Config) -> Self {
        Self {
            registry,
            metadata,
            config,
            cache: AsyncMutex::new(None),
        }
    }

    /// Per-node primary chunk counts and live availability, refreshed at
    /// most once per TTL.
    ///
    /// Holding the mutex across the check-and-refresh makes this
    /// single-flight: a second caller arriving mid-refresh waits for the same
    /// refresh rather than starting its own.
    pub async fn load_stats(&self) -> Result<HashMap<NodeId, LoadStats>> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.refreshed_at.elapsed() < self.config.load_stats_ttl() {
                return Ok(cached.stats.clone());
            }
        }

        let nodes = self.registry.active_nodes().await?;
        let mut stats = HashMap::new();
        for node in &nodes {
            let count = self
                .metadata
                .count_primary_chunks_for_node(&node.id)
                .await
                .map_err(|e| crate::error::Error::Other(e.into()))?;
            let available = self.registry.check_node_availability(node).await;
            stats.insert(node.id.clone(), LoadStats { chunk_count: count, available });
        }
        debug!("refreshed load stats for {} nodes", stats.len());
        *guard = Some(CachedStats { stats: stats.clone(), refreshed_at: Instant::now() });
        Ok(stats)
    }

    /// Drops the cached load stats so the next [`Self::load_stats`] call
    /// does a fresh read, used after a write changes a node's chunk count
    /// mid-upload instead of waiting out the TTL.
    pub async fn invalidate_load_stats(&self) {
        *self.cache.lock().await = None;
    }

    /// Pings every active node and, if the current primary (if any) is
    /// unreachable, elects the reachable node with the lowest tie-break key.
    pub async fn check_nodes_and_elect_primary(&self) -> Result<()> {
        let nodes = self.registry.active_nodes().await?;
        let mut reachable = Vec::new();
        for node in &nodes {
            if self.registry.check_node_availability(node).await {
                reachable.push(node.clone());
            } else {
                warn!("node {} unreachable during health check", node.id);
            }
        }

        let current_primary = nodes.iter().find(|n| n.is_primary);
        let primary_still_reachable = current_primary
            .map(|p| reachable.iter().any(|n| n.id == p.id))
            .unwrap_or(false);

        if primary_still_reachable {
            return Ok(());
        }

        if let Some(elected) = Self::best_candidate(&reachable) {
            info!("electing node {} as primary", elected.id);
            self.metadata
                .elect_primary(&elected.id)
                .await
                .map_err(|e| crate::error::Error::Other(e.into()))?;
        } else {
            warn!("no reachable node available to elect as primary");
        }
        Ok(())
    }

    fn best_candidate(nodes: &[Node]) -> Option<&Node> {
        nodes.iter().min_by_key(|n| n.tie_break_key())
    }

    /// Runs [`Self::check_nodes_and_elect_primary`] on `config.monitor_interval`
    /// forever. Intended to be spawned as its own task by the host.
    pub async fn run_forever(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        loop {
            ticker.tick().await;
            if let Err(err) = self.check_nodes_and_elect_primary().await {
                warn!("node monitor tick failed: {err}");
            }
        }
    }
}
