//! `Placement` (spec §4.4): candidate selection for uploads and per-chunk
//! reads, grounded on `node_manager.py`'s `elect_best_node_for_upload` and
//! `select_node_for_chunk`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::chunk::FileId;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::monitor::{LoadStats, NodeMonitor};
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;

pub struct Placement {
    registry: Arc<NodeRegistry>,
    monitor: Arc<NodeMonitor>,
    metadata: Arc<dyn MetadataStore>,
}

impl Placement {
    pub fn new(registry: Arc<NodeRegistry>, monitor: Arc<NodeMonitor>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { registry, monitor, metadata }
    }

    /// The Active, currently-available node with the smallest `chunk_count`,
    /// excluding `exclude`. Falls back to the elected primary if it is
    /// itself available, else reports no node.
    pub async fn select_for_upload(&self, exclude: &HashSet<NodeId>) -> Result<Node> {
        let nodes = self.registry.active_nodes().await?;
        let stats = self.monitor.load_stats().await?;

        let mut candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| !exclude.contains(&n.id))
            .filter(|n| Self::is_available(&stats, &n.id))
            .collect();

        if candidates.is_empty() {
            if let Some(primary) = self.registry.primary_node().await? {
                if Self::is_available(&stats, &primary.id) {
                    return Ok(primary);
                }
            }
            return Err(Error::NoAvailableNodes);
        }

        candidates.sort_by_key(|n| {
            let load = stats.get(&n.id).map(|s| s.chunk_count).unwrap_or(0);
            (load, n.priority, n.id.clone())
        });
        Ok(candidates[0].clone())
    }

    /// For reads (spec §4.4 `SelectForChunk`): prefer an existing non-replica
    /// row for `(file_id, chunk_number)` whose node is Active+available and
    /// not excluded; else a replica row with the same property; else fall
    /// back to [`Self::select_for_upload`].
    pub async fn select_for_chunk(&self, file_id: FileId, chunk_number: i64, exclude: &HashSet<NodeId>) -> Result<Node> {
        let rows = self.metadata.list_chunks_for_file(file_id).await.map_err(Error::from)?;
        let nodes = self.registry.active_nodes().await?;
        let active_by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let stats = self.monitor.load_stats().await?;

        let eligible = |node_id: &str| -> bool {
            !exclude.contains(node_id) && active_by_id.contains_key(node_id) && Self::is_available(&stats, node_id)
        };

        if let Some(row) = rows.iter().find(|c| c.chunk_number == chunk_number && !c.is_replica && eligible(&c.node_id)) {
            return Ok((*active_by_id[row.node_id.as_str()]).clone());
        }
        if let Some(row) = rows.iter().find(|c| c.chunk_number == chunk_number && c.is_replica && eligible(&c.node_id)) {
            return Ok((*active_by_id[row.node_id.as_str()]).clone());
        }
        self.select_for_upload(exclude).await
    }

    /// Forces the next selection to see fresh load counts, used after a
    /// chunk write changes a node's count mid-upload.
    pub async fn invalidate_load_stats(&self) {
        self.monitor.invalidate_load_stats().await;
    }

    fn is_available(stats: &HashMap<NodeId, LoadStats>, node_id: &str) -> bool {
        stats.get(node_id).map(|s| s.available).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::chunk::{Chunk, ChunkStatus};
    use crate::config::Config;
    use crate::metadata::{InMemoryMetadataStore, MetadataStore};
    use crate::node::AdminStatus;
    use crate::registry::{BackendFactory, StaticBackendFactory};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_node(id: &str, priority: i32) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("{id}.example.invalid"),
            credentials: "secret".into(),
            bucket: "bucket".into(),
            priority,
            admin_status: AdminStatus::Active,
            is_primary: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn setup() -> (Placement, Arc<dyn MetadataStore>, Vec<Arc<MemoryBackend>>) {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let factory = Arc::new(StaticBackendFactory::new());
        let mut backends = Vec::new();
        for (id, prio) in [("a", 1), ("b", 1), ("c", 2)] {
            let backend = Arc::new(MemoryBackend::new());
            factory.register(id, backend.clone() as Arc<dyn crate::backend::BackendClient>);
            backends.push(backend);
            metadata.upsert_node(sample_node(id, prio)).await.unwrap();
        }
        let registry = Arc::new(NodeRegistry::new(metadata.clone(), factory as Arc<dyn BackendFactory>));
        let monitor = Arc::new(NodeMonitor::new(registry.clone(), metadata.clone(), Config::default()));
        (Placement::new(registry, monitor, metadata.clone()), metadata, backends)
    }

    #[tokio::test]
    async fn ties_break_by_priority_then_id() {
        let (placement, _metadata, _backends) = setup().await;
        let chosen = placement.select_for_upload(&HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[tokio::test]
    async fn excluded_nodes_are_skipped() {
        let (placement, _metadata, _backends) = setup().await;
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        exclude.insert("b".to_string());
        let chosen = placement.select_for_upload(&exclude).await.unwrap();
        assert_eq!(chosen.id, "c");
    }

    #[tokio::test]
    async fn unavailable_nodes_are_not_candidates() {
        let (placement, _metadata, backends) = setup().await;
        backends[0].set_reachable(false); // "a"
        let chosen = placement.select_for_upload(&HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[tokio::test]
    async fn falls_back_to_available_primary_when_all_excluded() {
        let (placement, metadata, _backends) = setup().await;
        metadata.elect_primary("c").await.unwrap();
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        exclude.insert("b".to_string());
        exclude.insert("c".to_string());
        let chosen = placement.select_for_upload(&exclude).await.unwrap();
        assert_eq!(chosen.id, "c");
    }

    #[tokio::test]
    async fn no_candidates_and_no_primary_is_no_available_nodes() {
        let (placement, _metadata, _backends) = setup().await;
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        exclude.insert("b".to_string());
        exclude.insert("c".to_string());
        assert!(matches!(placement.select_for_upload(&exclude).await, Err(Error::NoAvailableNodes)));
    }

    #[tokio::test]
    async fn select_for_chunk_prefers_existing_primary_row() {
        let (placement, metadata, _backends) = setup().await;
        let file_id = Uuid::new_v4();
        let now = Utc::now();
        metadata
            .insert_chunk(Chunk {
                id: Uuid::new_v4(),
                file_id,
                chunk_number: 1,
                size_bytes: 1,
                digest: "d".into(),
                object_key: "chunks/o/x_1_n.chunk".into(),
                node_id: "c".into(),
                is_replica: false,
                status: ChunkStatus::Uploaded,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let chosen = placement.select_for_chunk(file_id, 1, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, "c");
    }

    #[tokio::test]
    async fn select_for_chunk_falls_back_to_replica_when_primary_unavailable() {
        let (placement, metadata, backends) = setup().await;
        let file_id = Uuid::new_v4();
        let now = Utc::now();
        metadata
            .insert_chunk(Chunk {
                id: Uuid::new_v4(),
                file_id,
                chunk_number: 1,
                size_bytes: 1,
                digest: "d".into(),
                object_key: "chunks/o/x_1_n.chunk".into(),
                node_id: "a".into(),
                is_replica: false,
                status: ChunkStatus::Uploaded,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        metadata
            .insert_chunk(Chunk {
                id: Uuid::new_v4(),
                file_id,
                chunk_number: 1,
                size_bytes: 1,
                digest: "d".into(),
                object_key: "replicas/o/x_1_n.chunk".into(),
                node_id: "b".into(),
                is_replica: true,
                status: ChunkStatus::Uploaded,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        backends[0].set_reachable(false); // "a", the primary's node
        let chosen = placement.select_for_chunk(file_id, 1, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[tokio::test]
    async fn select_for_chunk_falls_back_to_select_for_upload_with_no_rows() {
        let (placement, _metadata, _backends) = setup().await;
        let file_id = Uuid::new_v4();
        let chosen = placement.select_for_chunk(file_id, 1, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, "a");
    }
}
