//! Crate-wide error kinds.
//!
//! Every public operation returns `Result<T, Error>`. The variants mirror the
//! error kinds a caller needs to branch on (see the propagation policy in the
//! module docs); anything else is wrapped in `Other` the way `client/pull.rs`
//! lets unanticipated `anyhow::Error`s flow through in the teacher.

use uuid::Uuid;

use crate::backend::BackendError;
use crate::metadata::MetadataError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no storage node available for this operation")]
    NoAvailableNodes,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("integrity check failed: {0}")]
    BackendIntegrity(String),

    #[error("missing chunk {chunk_number} for file {file_id}")]
    MissingChunk { file_id: Uuid, chunk_number: i64 },

    #[error("file unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Error::BackendUnavailable(msg),
            BackendError::IntegrityRefused(msg) => Error::BackendIntegrity(msg),
            BackendError::NotFound(msg) => Error::Other(anyhow::anyhow!("object not found: {msg}")),
            BackendError::Other(msg) => Error::Other(anyhow::anyhow!(msg)),
        }
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Conflict(msg) => Error::MetadataConflict(msg),
            MetadataError::NotFound(msg) => Error::Other(anyhow::anyhow!(msg)),
            MetadataError::Other(msg) => Error::Other(anyhow::anyhow!(msg)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
