//! `ReplicationManager` (spec §4): creates, verifies and repairs replicas,
//! grounded method-for-method on `redundancy.py`'s `create_replicas_for_chunk`,
//! `ensure_minimum_replicas`, `verify_and_repair_all_chunks`, `repair_chunk`
//! and `check_file_integrity`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use crate::backend::format_object_key;
use crate::cache::Cache;
use crate::chunk::{Chunk, ChunkStatus, FileId, PendingReplication};
use crate::config::Config;
use crate::digest::sha256_hex;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::node::{Node, NodeId};
use crate::placement::Placement;
use crate::registry::NodeRegistry;

/// Outcome of a [`ReplicationManager::ensure_minimum_replicas`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureReplicasStats {
    pub checked: usize,
    pub created: usize,
    pub failed: usize,
    pub already_sufficient: usize,
}

pub struct ReplicationManager {
    registry: Arc<NodeRegistry>,
    placement: Arc<Placement>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<Cache>,
    config: Config,
}

impl ReplicationManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        placement: Arc<Placement>,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<Cache>,
        config: Config,
    ) -> Self {
        Self { registry, placement, metadata, cache, config }
    }

    fn existing_replica_holders(chunks: &[Chunk], primary: &Chunk) -> HashSet<NodeId> {
        chunks
            .iter()
            .filter(|c| c.chunk_number == primary.chunk_number && c.is_replica)
            .map(|c| c.node_id.clone())
            .collect()
    }

    /// Tops a single primary chunk up to `config.min_replicas`, skipping
    /// nodes in `exclude` or that already hold a copy. Refuses outright if
    /// `primary` is itself a replica, isn't `Uploaded`, or has no source
    /// node — these would mean replicating a replica, an incomplete write,
    /// or nothing to read from.
    pub async fn create_replicas_for_chunk(&self, primary: &Chunk, exclude: &HashSet<NodeId>) -> Result<()> {
        if primary.is_replica {
            return Err(Error::MetadataConflict(format!("chunk {} is itself a replica", primary.id)));
        }
        if primary.status != ChunkStatus::Uploaded {
            return Err(Error::MetadataConflict(format!("chunk {} is not Uploaded", primary.id)));
        }
        if primary.node_id.is_empty() {
            return Err(Error::MetadataConflict(format!("chunk {} has no source node", primary.id)));
        }

        let siblings = self.metadata.list_chunks_for_file(primary.file_id).await.map_err(Error::from)?;
        let mut held = Self::existing_replica_holders(&siblings, primary);
        held.insert(primary.node_id.clone());
        held.extend(exclude.iter().cloned());

        let existing_count = Self::existing_replica_holders(&siblings, primary).len();
        let needed = self.config.min_replicas.saturating_sub(existing_count);

        for _ in 0..needed {
            let target = match self.placement.select_for_upload(&held).await {
                Ok(node) => node,
                Err(err) => {
                    warn!("no placement candidate for replica of chunk {}: {err}", primary.id);
                    self.queue_pending(primary.id, None).await?;
                    return Err(err);
                }
            };
            held.insert(target.id.clone());
            match self.create_replica_on_node(primary, &target).await {
                Ok(_) => {}
                Err(err @ Error::BackendIntegrity(_)) => {
                    warn!("source of chunk {} failed digest check, aborting replication: {err}", primary.id);
                    return Err(err);
                }
                Err(err) => {
                    warn!("replica creation on {} failed for chunk {}: {err}", target.id, primary.id);
                    self.queue_pending(primary.id, Some(&target.id)).await?;
                }
            }
        }
        Ok(())
    }

    async fn queue_pending(&self, chunk_id: Uuid, target_node_id: Option<&str>) -> Result<()> {
        let target = match target_node_id {
            Some(id) => id.to_string(),
            None => return Ok(()),
        };
        self.metadata
            .enqueue_pending(PendingReplication {
                chunk_id,
                target_node_id: target,
                attempts: 0,
                last_attempt_at: None,
            })
            .await
            .map_err(Error::from)
    }

    /// Fetches `primary`'s bytes, verifies them against its recorded digest,
    /// and writes a replica object + row onto `target`. Skips the write
    /// entirely (returning the existing row) if `target` already holds a
    /// copy of this position — re-checked here against a race with another
    /// concurrent caller, not just the caller's own exclude set.
    pub async fn create_replica_on_node(&self, primary: &Chunk, target: &Node) -> Result<Chunk> {
        let siblings = self.metadata.list_chunks_for_file(primary.file_id).await.map_err(Error::from)?;
        if let Some(existing) = siblings
            .iter()
            .find(|c| c.is_replica && c.chunk_number == primary.chunk_number && c.node_id == target.id)
        {
            return Ok(existing.clone());
        }

        let source_node = self.registry.get_node(&primary.node_id).await?;
        let source_client = self.registry.client_for(&source_node).await?;
        let data = source_client.get_object(&primary.object_key).await.map_err(Error::from)?;

        let digest = sha256_hex(&data);
        if digest != primary.digest {
            let _ = self.metadata.update_chunk_status(primary.id, ChunkStatus::Corrupt).await;
            return Err(Error::BackendIntegrity(format!(
                "primary chunk {} digest mismatch before replication",
                primary.id
            )));
        }

        let target_client = self.registry.client_for(target).await?;
        let nonce = Uuid::new_v4().simple().to_string();
        let owner = primary.object_key.split('/').nth(1).unwrap_or("unknown").to_string();
        let object_key = format_object_key(&owner, primary.file_id, primary.chunk_number, &nonce, true);
        target_client.put_object(&object_key, data).await.map_err(Error::from)?;

        let now = Utc::now();
        let replica = Chunk {
            id: Uuid::new_v4(),
            file_id: primary.file_id,
            chunk_number: primary.chunk_number,
            size_bytes: primary.size_bytes,
            digest,
            object_key,
            node_id: target.id.clone(),
            is_replica: true,
            status: ChunkStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        match self.metadata.insert_chunk(replica.clone()).await {
            Ok(()) => {
                info!("created replica of chunk {} on node {}", primary.id, target.id);
                Ok(replica)
            }
            Err(crate::metadata::MetadataError::Conflict(_)) => {
                // Lost a race with another caller replicating the same
                // position onto the same node; their row stands.
                let siblings = self.metadata.list_chunks_for_file(primary.file_id).await.map_err(Error::from)?;
                siblings
                    .into_iter()
                    .find(|c| c.is_replica && c.chunk_number == primary.chunk_number && c.node_id == target.id)
                    .ok_or_else(|| Error::Other(anyhow::anyhow!("replica row vanished after conflict")))
            }
            Err(err) => Err(Error::from(err)),
        }
    }

    /// Sweeps every primary `Uploaded` chunk across the whole store and tops
    /// each one up to `config.min_replicas`, per spec §4.6
    /// `EnsureMinimumReplicas`.
    pub async fn ensure_minimum_replicas(&self) -> Result<EnsureReplicasStats> {
        let all = self.metadata.list_all_chunks().await.map_err(Error::from)?;
        let mut stats = EnsureReplicasStats::default();

        for chunk in all.iter().filter(|c| !c.is_replica && c.status == ChunkStatus::Uploaded) {
            stats.checked += 1;
            let existing_count = Self::existing_replica_holders(&all, chunk).len();
            if existing_count >= self.config.min_replicas {
                stats.already_sufficient += 1;
                continue;
            }
            match self.create_replicas_for_chunk(chunk, &HashSet::new()).await {
                Ok(()) => stats.created += 1,
                Err(err) => {
                    warn!("ensure_minimum_replicas failed for chunk {}: {err}", chunk.id);
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Re-downloads every chunk's bytes and compares against its recorded
    /// digest. A corrupt primary is repaired in place from a good replica; a
    /// corrupt replica is just marked and left for `EnsureMinimumReplicas`
    /// to re-create elsewhere, since replicas are never repaired.
    pub async fn verify_and_repair_all_chunks(&self) -> Result<()> {
        let chunks = self.metadata.list_all_chunks().await.map_err(Error::from)?;
        for chunk in chunks {
            if let Err(err) = self.verify_one(&chunk).await {
                warn!("chunk {} failed integrity check: {err}", chunk.id);
                self.metadata
                    .update_chunk_status(chunk.id, ChunkStatus::Corrupt)
                    .await
                    .map_err(Error::from)?;
                if !chunk.is_replica {
                    self.repair_chunk(&chunk).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify_one(&self, chunk: &Chunk) -> Result<()> {
        let node = self.registry.get_node(&chunk.node_id).await?;
        let client = self.registry.client_for(&node).await?;
        let data = client.get_object(&chunk.object_key).await.map_err(Error::from)?;
        if sha256_hex(&data) != chunk.digest {
            return Err(Error::BackendIntegrity(format!("chunk {} digest mismatch", chunk.id)));
        }
        Ok(())
    }

    /// Repairs a corrupt primary in place from the first replica that still
    /// verifies: re-uploads its bytes under the primary's own object key and
    /// flips the row back to `Uploaded`. Never called for a replica — per
    /// spec, replicas are re-created elsewhere instead of repaired.
    ///
    /// Invalidates the file's whole-file cache entry, since a repair rewrites
    /// an object key (a structural change) even though the bytes it produces
    /// are the same — replica creation does not invalidate, since it changes
    /// nothing the reassembled file depends on.
    pub async fn repair_chunk(&self, primary: &Chunk) -> Result<()> {
        let siblings = self.metadata.list_chunks_for_file(primary.file_id).await.map_err(Error::from)?;
        let mut source_data = None;
        for candidate in siblings.iter().filter(|c| {
            c.chunk_number == primary.chunk_number && c.id != primary.id && c.status == ChunkStatus::Uploaded
        }) {
            if self.verify_one(candidate).await.is_ok() {
                let node = self.registry.get_node(&candidate.node_id).await?;
                let client = self.registry.client_for(&node).await?;
                if let Ok(data) = client.get_object(&candidate.object_key).await {
                    source_data = Some(data);
                    break;
                }
            }
        }

        let Some(data) = source_data else {
            return Err(Error::Unrecoverable(format!(
                "no surviving copy of chunk {} to repair from",
                primary.chunk_number
            )));
        };

        let node = self.registry.get_node(&primary.node_id).await?;
        let client = self.registry.client_for(&node).await?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let owner = primary.object_key.split('/').nth(1).unwrap_or("unknown").to_string();
        let object_key = crate::backend::format_object_key(&owner, primary.file_id, primary.chunk_number, &nonce, false);
        client.put_object(&object_key, data).await.map_err(Error::from)?;

        let mut repaired = primary.clone();
        repaired.object_key = object_key;
        repaired.status = ChunkStatus::Uploaded;
        repaired.updated_at = Utc::now();
        self.metadata.update_chunk(repaired).await.map_err(Error::from)?;
        self.cache.invalidate(primary.file_id);
        info!("repaired primary chunk {}", primary.id);
        Ok(())
    }

    /// Counts, per chunk position of `file_id`, how many positions still
    /// have at least one digest-verified copy, against the total number of
    /// positions. Shared by [`Self::check_file_integrity`] and
    /// [`crate::health::HealthReport`].
    pub async fn verified_chunk_positions(&self, file_id: FileId) -> Result<(usize, usize)> {
        let chunks = self.metadata.list_chunks_for_file(file_id).await.map_err(Error::from)?;
        let mut by_number: std::collections::HashMap<i64, Vec<&Chunk>> = std::collections::HashMap::new();
        for chunk in &chunks {
            by_number.entry(chunk.chunk_number).or_default().push(chunk);
        }
        let total = by_number.len();
        let mut verified = 0usize;
        for copies in by_number.values() {
            for copy in copies {
                if self.verify_one(copy).await.is_ok() {
                    verified += 1;
                    break;
                }
            }
        }
        Ok((verified, total))
    }

    /// Whether every primary chunk of `file_id` currently has at least one
    /// retrievable, digest-verified copy (primary or replica).
    pub async fn check_file_integrity(&self, file_id: FileId) -> Result<bool> {
        let (verified, total) = self.verified_chunk_positions(file_id).await?;
        Ok(verified == total)
    }
}
