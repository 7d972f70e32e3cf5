//! `Reassembler` (spec §4): streams a file back out in chunk order, failing
//! over from a primary to its replicas, grounded on
//! `utils.py`'s `reassemble_file_optimized` / `get_healthy_nodes` /
//! `_get_replica_data` / `_recover_missing_chunks`.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cache::Cache;
use crate::chunk::{Chunk, ChunkStatus, FileId};
use crate::digest::sha256_hex;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::node::NodeId;
use crate::placement::Placement;
use crate::registry::NodeRegistry;

pub struct Reassembler {
    registry: Arc<NodeRegistry>,
    metadata: Arc<dyn MetadataStore>,
    placement: Arc<Placement>,
    cache: Arc<Cache>,
}

impl Reassembler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        metadata: Arc<dyn MetadataStore>,
        placement: Arc<Placement>,
        cache: Arc<Cache>,
    ) -> Self {
        Self { registry, metadata, placement, cache }
    }

    /// Whole file in memory, for callers that want a single buffer. Checked
    /// against and populated into the whole-file cache; [`Self::reassemble_into`]
    /// is the uncached streaming path.
    pub async fn reassemble(&self, file_id: FileId) -> Result<Bytes> {
        if let Some(cached) = self.cache.get(file_id) {
            return Ok(cached);
        }
        let mut out = BytesMut::new();
        self.reassemble_into(file_id, &mut BytesMutWriter(&mut out)).await?;
        let bytes = out.freeze();
        self.cache.put(file_id, bytes.clone());
        Ok(bytes)
    }

    /// Streams the file's bytes, in chunk order, into `writer`.
    pub async fn reassemble_into<W: AsyncWrite + Unpin>(&self, file_id: FileId, writer: &mut W) -> Result<()> {
        let all = self.metadata.list_chunks_for_file(file_id).await.map_err(Error::from)?;
        let mut primaries: Vec<&Chunk> = all.iter().filter(|c| !c.is_replica).collect();
        primaries.sort_by_key(|c| c.chunk_number);

        for (position, chunk) in primaries.iter().enumerate() {
            let expected = position as i64 + 1;
            if chunk.chunk_number != expected {
                return Err(Error::MissingChunk { file_id, chunk_number: expected });
            }
        }

        // Tracked across the whole retrieval, not per chunk: a node that
        // fails once (unreachable, digest mismatch) is skipped for every
        // remaining chunk instead of being retried each time.
        let mut failed_nodes: HashSet<NodeId> = HashSet::new();
        for primary in primaries.iter().copied() {
            let data = self.fetch_chunk(file_id, primary.chunk_number, &all, &mut failed_nodes).await?;
            writer.write_all(&data).await.map_err(|e| Error::Other(e.into()))?;
        }
        writer.flush().await.map_err(|e| Error::Other(e.into()))?;

        let _ = self.metadata.touch_last_accessed(file_id).await;
        Ok(())
    }

    async fn fetch_chunk(
        &self,
        file_id: FileId,
        chunk_number: i64,
        all: &[Chunk],
        failed_nodes: &mut HashSet<NodeId>,
    ) -> Result<Bytes> {
        loop {
            let node = match self.placement.select_for_chunk(file_id, chunk_number, failed_nodes).await {
                Ok(node) => node,
                Err(Error::NoAvailableNodes) => {
                    return Err(Error::Unrecoverable(format!(
                        "no valid copy of chunk {chunk_number} for file {file_id}"
                    )))
                }
                Err(err) => return Err(err),
            };

            let row = match all.iter().find(|c| c.chunk_number == chunk_number && c.node_id == node.id) {
                Some(row) => row,
                None => {
                    failed_nodes.insert(node.id.clone());
                    continue;
                }
            };

            let client = match self.registry.client_for(&node).await {
                Ok(client) => client,
                Err(_) => {
                    failed_nodes.insert(node.id.clone());
                    continue;
                }
            };

            match client.get_object(&row.object_key).await {
                Ok(data) if sha256_hex(&data) == row.digest => {
                    debug!("served chunk {chunk_number} of {file_id} from {}", node.id);
                    return Ok(data);
                }
                Ok(_) => {
                    warn!("chunk {chunk_number} of {file_id} on {} failed digest check", node.id);
                    if !row.is_replica {
                        // Lazy corruption detection: a primary that fails
                        // its digest check on read is marked Corrupt so
                        // verify_and_repair_all_chunks picks it up later.
                        let _ = self.metadata.update_chunk_status(row.id, ChunkStatus::Corrupt).await;
                    }
                    failed_nodes.insert(node.id.clone());
                }
                Err(err) => {
                    warn!("chunk {chunk_number} of {file_id} unreachable on {}: {err}", node.id);
                    failed_nodes.insert(node.id.clone());
                }
            }
        }
    }
}

struct BytesMutWriter<'a>(&'a mut BytesMut);

impl<'a> tokio::io::AsyncWrite for BytesMutWriter<'a> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::result::Result<usize, std::io::Error>> {
        self.get_mut().0.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}
