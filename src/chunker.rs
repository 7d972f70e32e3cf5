//! `Chunker` (spec §4): splits an incoming stream into fixed-size chunks,
//! uploads each to its primary node and replicates it, grounded on
//! `utils.py`'s `FileChunker.chunk_file` / `_create_replicas` /
//! `_cleanup_partial_upload`.

use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::format_object_key;
use crate::chunk::{Chunk, ChunkStatus, StoredFile};
use crate::config::Config;
use crate::digest::{sha256_hex, StreamingDigest};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::placement::Placement;
use crate::registry::NodeRegistry;
use crate::replication::ReplicationManager;

pub struct UploadRequest {
    pub owner: String,
    pub display_name: String,
    pub original_filename: String,
    pub content_type: String,
    pub type_tag: String,
}

pub struct Chunker {
    registry: Arc<NodeRegistry>,
    placement: Arc<Placement>,
    metadata: Arc<dyn MetadataStore>,
    replication: Arc<ReplicationManager>,
    config: Config,
}

impl Chunker {
    pub fn new(
        registry: Arc<NodeRegistry>,
        placement: Arc<Placement>,
        metadata: Arc<dyn MetadataStore>,
        replication: Arc<ReplicationManager>,
        config: Config,
    ) -> Self {
        Self { registry, placement, metadata, replication, config }
    }

    /// Refuses to start an upload unless at least `min_available_nodes_for_upload`
    /// nodes are currently active and reachable (enough room for a primary
    /// plus the configured replica count).
    async fn check_upload_gate(&self) -> Result<()> {
        let nodes = self.registry.active_nodes().await?;
        let mut available = 0usize;
        for node in &nodes {
            if self.registry.check_node_availability(node).await {
                available += 1;
            }
        }
        if available < self.config.min_available_nodes_for_upload {
            return Err(Error::NoAvailableNodes);
        }
        Ok(())
    }

    /// Uploads `reader` as a new file, chunk by chunk, replicating each chunk
    /// as it lands. On cancellation the partial upload is torn down
    /// best-effort before the error is returned. Any other failure leaves
    /// already-written chunks in place — the caller may clean up the
    /// `StoredFile` on overall failure, or retry/resume.
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        request: UploadRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StoredFile> {
        let file_id = Uuid::new_v4();
        self.check_upload_gate().await?;

        let mut whole_digest = StreamingDigest::new();
        let mut chunk_number: i64 = 0;
        let mut total_size: u64 = 0;
        let mut buf = BytesMut::zeroed(self.config.chunk_size as usize);

        let result: Result<()> = async {
            loop {
                if *cancel.borrow() {
                    return Err(Error::Cancelled);
                }

                let mut filled = 0usize;
                while filled < buf.len() {
                    let n = reader.read(&mut buf[filled..]).await.map_err(|e| Error::Other(e.into()))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    break;
                }

                chunk_number += 1;
                let data = bytes::Bytes::copy_from_slice(&buf[..filled]);
                whole_digest.update(&data);
                total_size += data.len() as u64;
                let digest = sha256_hex(&data);

                // Placement is recomputed per chunk so load changes mid-upload
                // are respected; a node that rejects the write is excluded
                // and the next-best candidate tried instead.
                let mut excluded = std::collections::HashSet::new();
                let chunk = loop {
                    let node = self.placement.select_for_upload(&excluded).await?;
                    let client = self.registry.client_for(&node).await?;
                    let nonce = Uuid::new_v4().simple().to_string();
                    let object_key = format_object_key(&request.owner, file_id, chunk_number, &nonce, false);

                    match client.put_object(&object_key, data.clone()).await {
                        Ok(()) => {
                            let now = Utc::now();
                            break Chunk {
                                id: Uuid::new_v4(),
                                file_id,
                                chunk_number,
                                size_bytes: data.len() as u64,
                                digest: digest.clone(),
                                object_key,
                                node_id: node.id.clone(),
                                is_replica: false,
                                status: ChunkStatus::Uploaded,
                                created_at: now,
                                updated_at: now,
                            };
                        }
                        Err(err) => {
                            warn!("put_object on {} failed for chunk {chunk_number}, trying next node: {err}", node.id);
                            excluded.insert(node.id.clone());
                        }
                    }
                };
                self.metadata.insert_chunk(chunk.clone()).await.map_err(Error::from)?;
                self.placement.invalidate_load_stats().await;

                if let Err(err) = self.replication.create_replicas_for_chunk(&chunk, &std::collections::HashSet::new()).await {
                    warn!("replication for chunk {} failed at upload time, leaving for pending queue: {err}", chunk.id);
                }

                if filled < buf.len() {
                    break;
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            if matches!(err, Error::Cancelled) {
                warn!("upload of file {file_id} cancelled, cleaning up partial chunks");
                self.cleanup_partial_upload(file_id).await;
            } else {
                warn!("upload of file {file_id} failed, leaving partial chunks for the caller to clean up: {err}");
            }
            return Err(err);
        }

        let file = StoredFile {
            id: file_id,
            display_name: request.display_name,
            original_filename: request.original_filename,
            type_tag: request.type_tag,
            size_bytes: total_size,
            content_type: request.content_type,
            whole_file_digest: whole_digest.finish_hex(),
            owner: request.owner,
            uploaded_at: Utc::now(),
            last_accessed: None,
        };
        self.metadata.insert_file(file.clone()).await.map_err(Error::from)?;
        info!("uploaded file {file_id} as {} chunks", chunk_number);
        Ok(file)
    }

    /// Deletes every chunk and replica object already written for a file
    /// whose upload was cancelled, plus their metadata rows. Not called for
    /// a non-cancellation failure, where earlier chunks are left in place
    /// per spec §4.5.
    async fn cleanup_partial_upload(&self, file_id: Uuid) {
        let chunks = match self.metadata.list_chunks_for_file(file_id).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!("cleanup could not list chunks for file {file_id}: {err}");
                return;
            }
        };
        for chunk in &chunks {
            if let Ok(node) = self.registry.get_node(&chunk.node_id).await {
                if let Ok(client) = self.registry.client_for(&node).await {
                    if let Err(err) = client.delete_object(&chunk.object_key).await {
                        warn!("cleanup failed to delete object {}: {err}", chunk.object_key);
                    }
                }
            }
        }
        if let Err(err) = self.metadata.delete_chunks_for_file(file_id).await {
            warn!("cleanup could not delete chunk rows for file {file_id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, MemoryBackend};
    use crate::metadata::InMemoryMetadataStore;
    use crate::monitor::NodeMonitor;
    use crate::node::{AdminStatus, Node};
    use crate::registry::{BackendFactory, StaticBackendFactory};
    use std::io::Cursor;

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

    async fn setup(config: Config) -> (Chunker, Vec<Arc<MemoryBackend>>) {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let factory = Arc::new(StaticBackendFactory::new());
        let mut backends = Vec::new();
        for id in ["a", "b", "c"] {
            let backend = Arc::new(MemoryBackend::new());
            factory.register(id, backend.clone() as Arc<dyn BackendClient>);
            backends.push(backend);
            metadata.upsert_node(sample_node(id)).await.unwrap();
        }
        let registry = Arc::new(NodeRegistry::new(metadata.clone(), factory as Arc<dyn BackendFactory>));
        let monitor = Arc::new(NodeMonitor::new(registry.clone(), metadata.clone(), config.clone()));
        let placement = Arc::new(Placement::new(registry.clone(), monitor, metadata.clone()));
        let cache = Arc::new(crate::cache::Cache::new(config.clone()));
        let replication = Arc::new(ReplicationManager::new(registry.clone(), placement.clone(), metadata.clone(), cache, config.clone()));
        let chunker = Chunker::new(registry, placement, metadata, replication, config);
        (chunker, backends)
    }

    #[tokio::test]
    async fn upload_splits_into_expected_chunk_count() {
        let mut config = Config::default();
        config.chunk_size = 4;
        config.min_replicas = 1;
        let (chunker, _backends) = setup(config).await;
        let (_tx, rx) = watch::channel(false);
        let data = b"abcdefghij".to_vec(); // 10 bytes -> 3 chunks of 4,4,2
        let file = chunker
            .upload(
                Cursor::new(data),
                UploadRequest {
                    owner: "alice".into(),
                    display_name: "doc".into(),
                    original_filename: "doc.bin".into(),
                    content_type: "application/octet-stream".into(),
                    type_tag: "generic".into(),
                },
                rx,
            )
            .await
            .unwrap();
        assert_eq!(file.size_bytes, 10);
    }

    #[tokio::test]
    async fn cancellation_cleans_up_partial_upload() {
        let mut config = Config::default();
        config.chunk_size = 2;
        let (chunker, _backends) = setup(config).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let data = b"abcdefgh".to_vec();
        let err = chunker
            .upload(
                Cursor::new(data),
                UploadRequest {
                    owner: "alice".into(),
                    display_name: "doc".into(),
                    original_filename: "doc.bin".into(),
                    content_type: "application/octet-stream".into(),
                    type_tag: "generic".into(),
                },
                rx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
