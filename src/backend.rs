//! The `BackendClient` capability (spec §4, §9): per-node object storage.
//!
//! Mirrors the `ReadChunk`/`AsyncReadChunk` split in `backup/read_chunk.rs` —
//! a narrow trait the rest of the engine depends on, injected per node so
//! tests can swap in an in-memory backend instead of talking to real object
//! storage.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("integrity refused: {0}")]
    IntegrityRefused(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Object-store capability for a single node's bucket.
///
/// Implementors are expected to verify the digest of `data` against `key`
/// only where the underlying store supports it; whole-chunk integrity is the
/// caller's responsibility via [`crate::digest`].
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()>;

    async fn get_object(&self, key: &str) -> BackendResult<Bytes>;

    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    async fn object_exists(&self, key: &str) -> BackendResult<bool>;

    /// Idempotently makes sure this node's bucket exists, called once when a
    /// node is registered. A no-op on stores where the bucket is provisioned
    /// out of band.
    async fn ensure_bucket(&self) -> BackendResult<()>;

    /// Cheap reachability probe used by [`crate::monitor::NodeMonitor`].
    async fn ping(&self) -> BackendResult<()>;
}

/// Key prefix for a primary chunk's object key.
pub const PRIMARY_PREFIX: &str = "chunks";
/// Key prefix for a replica chunk's object key.
pub const REPLICA_PREFIX: &str = "replicas";

/// `chunks/{owner}/{file_id}_{chunk_number}_{nonce}.chunk` or the `replicas/`
/// equivalent, per the object-key layout contract.
pub fn format_object_key(
    owner: &str,
    file_id: uuid::Uuid,
    chunk_number: i64,
    nonce: &str,
    is_replica: bool,
) -> String {
    let prefix = if is_replica { REPLICA_PREFIX } else { PRIMARY_PREFIX };
    format!("{prefix}/{owner}/{file_id}_{chunk_number}_{nonce}.chunk")
}

/// In-memory `BackendClient` used by module and integration tests, and as a
/// reference implementation of the capability contract.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Bytes>>,
    reachable: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            reachable: Mutex::new(true),
        }
    }

    /// Test hook: simulate the node going offline/online.
    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }

    fn check_reachable(&self) -> BackendResult<()> {
        if *self.reachable.lock() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("node is offline".into()))
        }
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.check_reachable()?;
        self.objects.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        self.check_reachable()?;
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.check_reachable()?;
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> BackendResult<bool> {
        self.check_reachable()?;
        Ok(self.objects.lock().contains_key(key))
    }

    async fn ensure_bucket(&self) -> BackendResult<()> {
        self.check_reachable()
    }

    async fn ping(&self) -> BackendResult<()> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let backend = MemoryBackend::new();
        backend.put_object("k", Bytes::from_static(b"hello")).await.unwrap();
        let data = backend.get_object("k").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn offline_node_refuses_all_operations() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        assert!(backend.ping().await.is_err());
        assert!(backend.put_object("k", Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn ensure_bucket_fails_while_offline() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        assert!(backend.ensure_bucket().await.is_err());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(backend.get_object("missing").await, Err(BackendError::NotFound(_))));
    }

    #[test]
    fn object_key_layout() {
        let id = uuid::Uuid::nil();
        let key = format_object_key("alice", id, 3, "abc", false);
        assert_eq!(key, format!("chunks/alice/{id}_3_abc.chunk"));
        let key = format_object_key("alice", id, 3, "abc", true);
        assert_eq!(key, format!("replicas/alice/{id}_3_abc.chunk"));
    }
}
