//! `HealthReport` (spec §4): aggregate, per-node and per-file health views,
//! grounded on `health.py`'s `get_overall_status` / `get_node_health` /
//! `get_file_health` threshold tables.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::chunk::{ChunkStatus, FileId};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::node::{AdminStatus, Node};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Offline,
}

pub struct HealthReport {
    registry: Arc<NodeRegistry>,
    metadata: Arc<dyn MetadataStore>,
}

impl HealthReport {
    pub fn new(registry: Arc<NodeRegistry>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { registry, metadata }
    }

    /// A single node's health. Offline iff its admin status isn't `Active` —
    /// this is a pure admin-status check, not a live ping. Active nodes are
    /// scored by the fraction of their own chunk rows that are neither
    /// `Corrupt` nor `Failed`.
    pub async fn node_health(&self, node: &Node) -> HealthStatus {
        if !node.admin_status.is_active() {
            return HealthStatus::Offline;
        }
        let chunks = self.metadata.list_all_chunks().await.unwrap_or_default();
        let on_node: Vec<_> = chunks.iter().filter(|c| c.node_id == node.id).collect();
        if on_node.is_empty() {
            return HealthStatus::Healthy;
        }
        let bad = on_node.iter().filter(|c| matches!(c.status, ChunkStatus::Corrupt | ChunkStatus::Failed)).count();
        ratio_to_status(on_node.len() - bad, on_node.len(), 0.95, 0.80)
    }

    /// A single file's health, per `get_file_health`: critical if any primary
    /// chunk position (missing, corrupt, or failed) has no uploaded replica
    /// to recover from; warning if one is merely corrupt/failed/missing but
    /// recoverable; healthy otherwise.
    pub async fn file_health(&self, file_id: FileId) -> Result<HealthStatus> {
        let all = self.metadata.list_chunks_for_file(file_id).await.map_err(Error::from)?;
        let mut primaries: Vec<_> = all.iter().filter(|c| !c.is_replica).collect();
        primaries.sort_by_key(|c| c.chunk_number);

        let present: HashSet<i64> = primaries.iter().map(|c| c.chunk_number).collect();
        let highest = primaries.iter().map(|c| c.chunk_number).max().unwrap_or(0);
        let missing: Vec<i64> = (1..=highest).filter(|n| !present.contains(n)).collect();

        let has_uploaded_replica = |chunk_number: i64| {
            all.iter().any(|c| c.is_replica && c.chunk_number == chunk_number && c.status == ChunkStatus::Uploaded)
        };

        let mut can_recover = true;
        for &chunk_number in &missing {
            if !has_uploaded_replica(chunk_number) {
                can_recover = false;
            }
        }
        let mut corrupt_or_failed = false;
        for chunk in &primaries {
            if matches!(chunk.status, ChunkStatus::Corrupt | ChunkStatus::Failed) {
                corrupt_or_failed = true;
                if !has_uploaded_replica(chunk.chunk_number) {
                    can_recover = false;
                }
            }
        }

        Ok(if !can_recover {
            HealthStatus::Critical
        } else if corrupt_or_failed || !missing.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        })
    }

    /// Fleet-wide status, per `get_overall_status`: `node_health` is the flat
    /// active/total ratio across all nodes; `chunk_health` is the flat
    /// (uploaded-corrupt-failed)/uploaded ratio across all chunk rows.
    /// Neither is a live probe or a per-file integrity check.
    pub async fn overall_status(&self) -> Result<HealthStatus> {
        let nodes = self.registry.all_nodes().await?;
        let total_nodes = nodes.len();
        let active_nodes = nodes.iter().filter(|n| n.admin_status == AdminStatus::Active).count();
        let node_ratio = if total_nodes > 0 { active_nodes as f64 / total_nodes as f64 } else { 0.0 };

        let chunks = self.metadata.list_all_chunks().await.map_err(Error::from)?;
        let total_chunks = chunks.len();
        let corrupt = chunks.iter().filter(|c| c.status == ChunkStatus::Corrupt).count();
        let failed = chunks.iter().filter(|c| c.status == ChunkStatus::Failed).count();
        let chunk_ratio = if total_chunks > 0 {
            (total_chunks - corrupt - failed) as f64 / total_chunks as f64
        } else {
            1.0
        };

        Ok(if node_ratio < 0.50 || chunk_ratio < 0.80 {
            HealthStatus::Critical
        } else if node_ratio < 0.75 || chunk_ratio < 0.95 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        })
    }
}

fn ratio_to_status(good: usize, total: usize, healthy_at: f64, warning_at: f64) -> HealthStatus {
    let ratio = good as f64 / total.max(1) as f64;
    if ratio >= healthy_at {
        HealthStatus::Healthy
    } else if ratio >= warning_at {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    }
}
