//! Chunked, replicated object-storage front-end.
//!
//! This crate places a new file's bytes across a set of storage nodes as
//! fixed-size chunks, keeps each chunk replicated to a configured minimum,
//! repairs corrupt or missing copies, and reassembles a file back out with
//! automatic failover from a primary chunk to one of its replicas.
//!
//! Two capabilities are injected rather than hard-coded: [`backend::BackendClient`]
//! (a node's object store) and [`metadata::MetadataStore`] (the relational
//! facts about nodes, files, chunks and pending replications). Both ship an
//! in-memory implementation for tests; a host binary wires up real ones.

mod backend;
mod cache;
mod chunk;
mod chunker;
mod config;
mod digest;
mod error;
mod health;
mod metadata;
mod monitor;
mod node;
mod pending;
mod placement;
mod reassembler;
mod registry;
mod replication;

pub use backend::{format_object_key, BackendClient, BackendError, BackendResult, MemoryBackend};
pub use cache::{Cache, CacheStats};
pub use chunk::{Chunk, ChunkStatus, FileId, PendingReplication, StoredFile};
pub use chunker::{Chunker, UploadRequest};
pub use config::Config;
pub use digest::{sha256_hex, StreamingDigest};
pub use error::{Error, Result};
pub use health::{HealthReport, HealthStatus};
pub use metadata::{InMemoryMetadataStore, MetadataError, MetadataResult, MetadataStore};
pub use monitor::{LoadStats, NodeMonitor};
pub use node::{AdminStatus, Node, NodeId};
pub use pending::PendingQueue;
pub use placement::Placement;
pub use reassembler::Reassembler;
pub use registry::{BackendFactory, NodeRegistry, StaticBackendFactory};
pub use replication::{EnsureReplicasStats, ReplicationManager};
