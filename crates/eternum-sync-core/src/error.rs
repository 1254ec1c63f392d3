//! Error types for the sync kernel.

/// Failures reported by the remote indexer or the structure directory.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode indexer response: {0}")]
    Decode(String),
    #[error("indexer connection closed")]
    Closed,
}

/// Failures applying a batch to the entity store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store rejected batch: {0}")]
    Rejected(String),
}

/// Top-level error for sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("structure directory lookup failed: {0}")]
    Directory(String),
    #[error("switch attempt aborted before completing")]
    SwitchAborted,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
