//! The `MetadataStore` capability (spec §4, §9): the relational facts about
//! nodes, files, chunks and pending replications.
//!
//! Like [`crate::backend::BackendClient`], this is injected so the engine
//! never hard-codes a schema or a driver; `InMemoryMetadataStore` is the
//! reference implementation used by every module's own tests plus
//! `tests/integration.rs`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::chunk::{Chunk, ChunkStatus, FileId, PendingReplication, StoredFile};
use crate::node::{Node, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_nodes(&self) -> MetadataResult<Vec<Node>>;
    async fn get_node(&self, id: &str) -> MetadataResult<Node>;
    async fn upsert_node(&self, node: Node) -> MetadataResult<()>;

    /// Atomically clears `is_primary` on every node, then sets it on `id`.
    /// The "clear-then-set" must happen as one step so a reader never
    /// observes zero or more than one primary.
    async fn elect_primary(&self, id: &str) -> MetadataResult<()>;

    async fn insert_file(&self, file: StoredFile) -> MetadataResult<()>;
    async fn get_file(&self, id: FileId) -> MetadataResult<StoredFile>;
    async fn delete_file(&self, id: FileId) -> MetadataResult<()>;
    async fn touch_last_accessed(&self, id: FileId) -> MetadataResult<()>;

    async fn insert_chunk(&self, chunk: Chunk) -> MetadataResult<()>;
    async fn update_chunk_status(&self, chunk_id: Uuid, status: ChunkStatus) -> MetadataResult<()>;
    /// Replaces a chunk row wholesale, used by repair to rewrite `object_key`
    /// and `status` atomically once a corrupt primary has been rewritten.
    async fn update_chunk(&self, chunk: Chunk) -> MetadataResult<()>;
    async fn get_chunk(&self, chunk_id: Uuid) -> MetadataResult<Chunk>;
    async fn list_chunks_for_file(&self, file_id: FileId) -> MetadataResult<Vec<Chunk>>;
    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<()>;
    /// Every chunk row, used by the periodic integrity sweep.
    async fn list_all_chunks(&self) -> MetadataResult<Vec<Chunk>>;
    async fn delete_chunk(&self, chunk_id: Uuid) -> MetadataResult<()>;
    /// Primary chunk count for a node, used by [`crate::placement::Placement`]
    /// and [`crate::monitor::NodeMonitor`] to pick the least-loaded candidate.
    async fn count_primary_chunks_for_node(&self, node_id: &str) -> MetadataResult<u64>;

    async fn enqueue_pending(&self, pending: PendingReplication) -> MetadataResult<()>;
    /// Claim up to `limit` due rows for exclusive processing by this caller,
    /// so two concurrent drainers never replicate the same chunk twice.
    async fn claim_pending(&self, limit: usize) -> MetadataResult<Vec<PendingReplication>>;
    async fn release_pending(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()>;
    async fn record_pending_attempt(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()>;
    async fn remove_pending(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()>;
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<NodeId, Node>,
    files: HashMap<FileId, StoredFile>,
    chunks: HashMap<Uuid, Chunk>,
    pending: HashMap<(Uuid, NodeId), PendingReplication>,
    claimed: std::collections::HashSet<(Uuid, NodeId)>,
}

/// In-memory reference implementation, grounded in the same Django-ORM
/// entities `models.py` defines, minus the framework.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: Mutex<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn list_nodes(&self) -> MetadataResult<Vec<Node>> {
        Ok(self.tables.lock().nodes.values().cloned().collect())
    }

    async fn get_node(&self, id: &str) -> MetadataResult<Node> {
        self.tables
            .lock()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(format!("node {id}")))
    }

    async fn upsert_node(&self, node: Node) -> MetadataResult<()> {
        self.tables.lock().nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn elect_primary(&self, id: &str) -> MetadataResult<()> {
        let mut tables = self.tables.lock();
        if !tables.nodes.contains_key(id) {
            return Err(MetadataError::NotFound(format!("node {id}")));
        }
        for node in tables.nodes.values_mut() {
            node.is_primary = node.id == id;
            node.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_file(&self, file: StoredFile) -> MetadataResult<()> {
        self.tables.lock().files.insert(file.id, file);
        Ok(())
    }

    async fn get_file(&self, id: FileId) -> MetadataResult<StoredFile> {
        self.tables
            .lock()
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))
    }

    async fn delete_file(&self, id: FileId) -> MetadataResult<()> {
        self.tables.lock().files.remove(&id);
        Ok(())
    }

    async fn touch_last_accessed(&self, id: FileId) -> MetadataResult<()> {
        let mut tables = self.tables.lock();
        let file = tables
            .files
            .get_mut(&id)
            .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;
        file.last_accessed = Some(Utc::now());
        Ok(())
    }

    async fn insert_chunk(&self, chunk: Chunk) -> MetadataResult<()> {
        let mut tables = self.tables.lock();
        // At most one primary row per (file, chunk_number): a second primary
        // insert for the same position always conflicts. A replica row is
        // additionally keyed by node, since `min_replicas` spreads several
        // replicas of the same position across distinct nodes.
        let duplicate = tables.chunks.values().any(|c| {
            c.id != chunk.id
                && c.file_id == chunk.file_id
                && c.chunk_number == chunk.chunk_number
                && c.is_replica == chunk.is_replica
                && (!chunk.is_replica || c.node_id == chunk.node_id)
        });
        if duplicate {
            return Err(MetadataError::Conflict(format!(
                "chunk row already exists for file {} chunk {} is_replica={}",
                chunk.file_id, chunk.chunk_number, chunk.is_replica
            )));
        }
        tables.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    async fn update_chunk_status(&self, chunk_id: Uuid, status: ChunkStatus) -> MetadataResult<()> {
        let mut tables = self.tables.lock();
        let chunk = tables
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| MetadataError::NotFound(format!("chunk {chunk_id}")))?;
        chunk.status = status;
        chunk.updated_at = Utc::now();
        Ok(())
    }

    async fn update_chunk(&self, chunk: Chunk) -> MetadataResult<()> {
        self.tables.lock().chunks.insert(chunk.id, chunk);
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> MetadataResult<Chunk> {
        self.tables
            .lock()
            .chunks
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(format!("chunk {chunk_id}")))
    }

    async fn list_chunks_for_file(&self, file_id: FileId) -> MetadataResult<Vec<Chunk>> {
        Ok(self
            .tables
            .lock()
            .chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn delete_chunks_for_file(&self, file_id: FileId) -> MetadataResult<()> {
        self.tables.lock().chunks.retain(|_, c| c.file_id != file_id);
        Ok(())
    }

    async fn list_all_chunks(&self) -> MetadataResult<Vec<Chunk>> {
        Ok(self.tables.lock().chunks.values().cloned().collect())
    }

    async fn delete_chunk(&self, chunk_id: Uuid) -> MetadataResult<()> {
        self.tables.lock().chunks.remove(&chunk_id);
        Ok(())
    }

    async fn count_primary_chunks_for_node(&self, node_id: &str) -> MetadataResult<u64> {
        Ok(self
            .tables
            .lock()
            .chunks
            .values()
            .filter(|c| !c.is_replica && c.node_id == node_id)
            .count() as u64)
    }

    async fn enqueue_pending(&self, pending: PendingReplication) -> MetadataResult<()> {
        let key = (pending.chunk_id, pending.target_node_id.clone());
        self.tables.lock().pending.insert(key, pending);
        Ok(())
    }

    async fn claim_pending(&self, limit: usize) -> MetadataResult<Vec<PendingReplication>> {
        let mut tables = self.tables.lock();
        let candidates: Vec<(Uuid, NodeId)> = tables
            .pending
            .keys()
            .filter(|key| !tables.claimed.contains(*key))
            .take(limit)
            .cloned()
            .collect();
        let mut claimed = Vec::with_capacity(candidates.len());
        for key in candidates {
            tables.claimed.insert(key.clone());
            if let Some(row) = tables.pending.get(&key) {
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_pending(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()> {
        self.tables
            .lock()
            .claimed
            .remove(&(chunk_id, target_node_id.to_string()));
        Ok(())
    }

    async fn record_pending_attempt(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()> {
        let mut tables = self.tables.lock();
        let key = (chunk_id, target_node_id.to_string());
        if let Some(row) = tables.pending.get_mut(&key) {
            row.attempts += 1;
            row.last_attempt_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn remove_pending(&self, chunk_id: Uuid, target_node_id: &str) -> MetadataResult<()> {
        let key = (chunk_id, target_node_id.to_string());
        let mut tables = self.tables.lock();
        tables.pending.remove(&key);
        tables.claimed.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AdminStatus;

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
    async fn elect_primary_clears_previous_holder() {
        let store = InMemoryMetadataStore::new();
        store.upsert_node(sample_node("a")).await.unwrap();
        store.upsert_node(sample_node("b")).await.unwrap();
        store.elect_primary("a").await.unwrap();
        store.elect_primary("b").await.unwrap();
        let nodes = store.list_nodes().await.unwrap();
        let primaries: Vec<_> = nodes.iter().filter(|n| n.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, "b");
    }

    #[tokio::test]
    async fn insert_chunk_refuses_a_duplicate_file_chunk_number_is_replica_triple() {
        let store = InMemoryMetadataStore::new();
        let file_id = Uuid::new_v4();
        let now = Utc::now();
        let base = Chunk {
            id: Uuid::new_v4(),
            file_id,
            chunk_number: 1,
            size_bytes: 1,
            digest: "deadbeef".into(),
            object_key: "chunks/owner/x_1_n.chunk".into(),
            node_id: "a".into(),
            is_replica: false,
            status: ChunkStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        store.insert_chunk(base.clone()).await.unwrap();

        let mut dup = base.clone();
        dup.id = Uuid::new_v4();
        dup.node_id = "b".into();
        let err = store.insert_chunk(dup).await.unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(_)));

        let mut replica = base;
        replica.id = Uuid::new_v4();
        replica.is_replica = true;
        replica.node_id = "b".into();
        store.insert_chunk(replica).await.unwrap();
    }

    #[tokio::test]
    async fn claim_pending_is_exclusive_until_released() {
        let store = InMemoryMetadataStore::new();
        let chunk_id = Uuid::new_v4();
        store
            .enqueue_pending(PendingReplication {
                chunk_id,
                target_node_id: "a".into(),
                attempts: 0,
                last_attempt_at: None,
            })
            .await
            .unwrap();

        let first = store.claim_pending(10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_pending(10).await.unwrap();
        assert!(second.is_empty());

        store.release_pending(chunk_id, "a").await.unwrap();
        let third = store.claim_pending(10).await.unwrap();
        assert_eq!(third.len(), 1);
    }
}
