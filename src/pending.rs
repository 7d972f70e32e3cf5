//! `PendingQueue` (spec §4): drains failed-replication retries, grounded on
//! `process_pending_replications.py`'s command loop (max-attempts check,
//! node-availability check, attempt counter, delete-on-success).

use std::sync::Arc;

use log::{info, warn};

use crate::chunk::PendingReplication;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::registry::NodeRegistry;
use crate::replication::ReplicationManager;

pub struct PendingQueue {
    metadata: Arc<dyn MetadataStore>,
    registry: Arc<NodeRegistry>,
    replication: Arc<ReplicationManager>,
    config: Config,
}

impl PendingQueue {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        registry: Arc<NodeRegistry>,
        replication: Arc<ReplicationManager>,
        config: Config,
    ) -> Self {
        Self { metadata, registry, replication, config }
    }

    /// Claims up to `limit` due rows and retries each once. A row whose
    /// target is still unreachable after `config.pending_max_attempts`
    /// attempts is logged and left in place, not deleted — it is retried
    /// again the moment its target becomes reachable, regardless of attempt
    /// count.
    pub async fn drain(&self, limit: usize) -> Result<usize> {
        let claimed = self.metadata.claim_pending(limit).await.map_err(Error::from)?;
        let mut processed = 0;
        for row in claimed {
            self.process_one(&row).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_one(&self, row: &PendingReplication) {
        let node = match self.registry.get_node(&row.target_node_id).await {
            Ok(node) => node,
            Err(err) => {
                warn!("pending target node {} vanished: {err}", row.target_node_id);
                let _ = self.metadata.release_pending(row.chunk_id, &row.target_node_id).await;
                return;
            }
        };

        // Give up only once the node has stayed unreachable long enough to
        // exhaust the attempt budget; a node that just came back gets one
        // more try even if it's sitting exactly at the limit.
        if !self.registry.check_node_availability(&node).await {
            if row.attempts >= self.config.pending_max_attempts {
                warn!(
                    "skipping pending replication of chunk {} to node {}, already at {} attempts",
                    row.chunk_id, row.target_node_id, row.attempts
                );
                let _ = self.metadata.release_pending(row.chunk_id, &row.target_node_id).await;
                return;
            }
            let _ = self.metadata.record_pending_attempt(row.chunk_id, &row.target_node_id).await;
            let _ = self.metadata.release_pending(row.chunk_id, &row.target_node_id).await;
            return;
        }

        let primary = match self.metadata.get_chunk(row.chunk_id).await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("pending chunk {} vanished: {err}", row.chunk_id);
                let _ = self.metadata.remove_pending(row.chunk_id, &row.target_node_id).await;
                return;
            }
        };

        let _ = self.metadata.record_pending_attempt(row.chunk_id, &row.target_node_id).await;
        match self.replication.create_replica_on_node(&primary, &node).await {
            Ok(_) => {
                info!("pending replication of chunk {} to {} succeeded", row.chunk_id, row.target_node_id);
                let _ = self.metadata.remove_pending(row.chunk_id, &row.target_node_id).await;
            }
            Err(err) => {
                warn!("pending replication of chunk {} to {} failed again: {err}", row.chunk_id, row.target_node_id);
                let _ = self.metadata.release_pending(row.chunk_id, &row.target_node_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, MemoryBackend};
    use crate::chunk::{Chunk, ChunkStatus};
    use crate::metadata::InMemoryMetadataStore;
    use crate::monitor::NodeMonitor;
    use crate::node::{AdminStatus, Node};
    use crate::placement::Placement;
    use crate::registry::{BackendFactory, StaticBackendFactory};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_node(id: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("{id}.example.invalid"),
            credentials: "secret".into(),
            bucket: "bucket".into(),
            priority: 0,
            admin_status: AdminStatus::Active,
            is_primary: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn drain_retries_and_clears_a_claimed_row() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let factory = Arc::new(StaticBackendFactory::new());
        let primary_backend = Arc::new(MemoryBackend::new());
        let target_backend = Arc::new(MemoryBackend::new());
        factory.register("primary", primary_backend.clone() as Arc<dyn BackendClient>);
        factory.register("target", target_backend.clone() as Arc<dyn BackendClient>);
        metadata.upsert_node(sample_node("primary")).await.unwrap();
        metadata.upsert_node(sample_node("target")).await.unwrap();

        let data = bytes::Bytes::from_static(b"payload");
        let digest = crate::digest::sha256_hex(&data);
        primary_backend.put_object("chunks/owner/x_1_n.chunk", data).await.unwrap();

        let file_id = Uuid::new_v4();
        let chunk = Chunk {
            id: Uuid::new_v4(),
            file_id,
            chunk_number: 1,
            size_bytes: 7,
            digest,
            object_key: "chunks/owner/x_1_n.chunk".into(),
            node_id: "primary".into(),
            is_replica: false,
            status: ChunkStatus::Uploaded,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        metadata.insert_chunk(chunk.clone()).await.unwrap();
        metadata
            .enqueue_pending(PendingReplication {
                chunk_id: chunk.id,
                target_node_id: "target".into(),
                attempts: 0,
                last_attempt_at: None,
            })
            .await
            .unwrap();

        let registry = Arc::new(NodeRegistry::new(metadata.clone(), factory.clone() as Arc<dyn BackendFactory>));
        let config = Config::default();
        let monitor = Arc::new(NodeMonitor::new(registry.clone(), metadata.clone(), config.clone()));
        let placement = Arc::new(Placement::new(registry.clone(), monitor, metadata.clone()));
        let cache = Arc::new(crate::cache::Cache::new(config.clone()));
        let replication = Arc::new(ReplicationManager::new(registry.clone(), placement, metadata.clone(), cache, config.clone()));
        let queue = PendingQueue::new(metadata.clone(), registry, replication, config);

        let processed = queue.drain(10).await.unwrap();
        assert_eq!(processed, 1);

        let remaining = metadata.claim_pending(10).await.unwrap();
        assert!(remaining.is_empty());
    }
}
