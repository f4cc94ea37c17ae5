//! Error taxonomy surfaced by [`SyncCore`](crate::SyncCore).

use crate::engine::EngineError;
use crate::protocol::{DocumentId, ProtocolError};
use crate::storage::cold::StoreError;

/// Errors returned by the sync core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Malformed update or state bytes. The document is unchanged.
    #[error("malformed data for document {document}: {reason}")]
    Decode { document: DocumentId, reason: String },

    /// Restore target predates the retained history.
    #[error("version {requested} of document {document} is not retained (oldest retained: {oldest:?})")]
    VersionNotRetained {
        document: DocumentId,
        requested: u64,
        oldest: Option<u64>,
    },

    /// Durable write failed. The entry stays pending and is retried.
    #[error("persistence failed for document {document}: {source}")]
    Persistence {
        document: DocumentId,
        #[source]
        source: StoreError,
    },

    /// Some documents could not be flushed.
    #[error("flush incomplete: {} document(s) failed", .failed.len())]
    PartialFlush { failed: Vec<DocumentId> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Worker(String),

    #[error("sync core is shut down")]
    ShutDown,
}

impl SyncError {
    pub(crate) fn decode(document: DocumentId, err: EngineError) -> Self {
        SyncError::Decode {
            document,
            reason: err.to_string(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
