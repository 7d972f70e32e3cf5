//! `StoredFile`, `Chunk` and `PendingReplication` entities (spec §3).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeId;

pub type FileId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: FileId,
    pub display_name: String,
    pub original_filename: String,
    pub type_tag: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// SHA-256 over the original bytes, hex-encoded.
    pub whole_file_digest: String,
    pub owner: String,
    pub uploaded_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl fmt::Display for StoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub file_id: FileId,
    /// 1-based, contiguous among primaries of a fully-uploaded file.
    pub chunk_number: i64,
    pub size_bytes: u64,
    /// SHA-256 of the chunk bytes, hex-encoded.
    pub digest: String,
    pub object_key: String,
    pub node_id: NodeId,
    pub is_replica: bool,
    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_replica { "replica" } else { "primary" };
        write!(f, "{} chunk {} of {}", kind, self.chunk_number, self.file_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReplication {
    pub chunk_id: Uuid,
    pub target_node_id: NodeId,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}
