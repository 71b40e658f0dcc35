//! Error kinds shared by the fetch, store and sync layers.
//!
//! Per-item failures (`ItemError`) are contained by the sync driver; only
//! `SyncError` ends a pass.
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a `Transport` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{url} was not found")]
    NotFound { url: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode body of {url}: {message}")]
    Decode { url: String, message: String },
    #[error("I/O error while receiving {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("watermark for {source_name} cannot move back from {current} to {requested}")]
    WatermarkRegression {
        source_name: String,
        current: i64,
        requested: i64,
    },
}

/// Why a single item could not be synced.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item {0} is the reserved sentinel id")]
    Sentinel(i64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("item {id} has a malformed payload: {reason}")]
    Malformed { id: i64, reason: String, raw: String },
    #[error("media for item {id} could not be stored: {source}")]
    Download {
        id: i64,
        #[source]
        source: DownloadError,
    },
    #[error("item {id} could not be stored: {source}")]
    Storage {
        id: i64,
        #[source]
        source: StoreError,
    },
}

impl ItemError {
    pub fn malformed(id: i64, reason: impl Into<String>, raw: impl Into<String>) -> Self {
        ItemError::Malformed {
            id,
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Permanent skips are dropped from the outstanding set; everything else
    /// holds the watermark and is attempted again next pass.
    pub fn is_permanent_skip(&self) -> bool {
        matches!(self, ItemError::Sentinel(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Sentinel(_) => "sentinel",
            ItemError::Transport(_) => "transport",
            ItemError::Malformed { .. } => "malformed",
            ItemError::Download { .. } => "download",
            ItemError::Storage { .. } => "storage",
        }
    }
}

/// Discovery of the remote maximum id failed.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("latest-id response was unusable: {0}")]
    Malformed(String),
}

/// Pass-fatal errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not discover the latest {source_name} id: {source}")]
    Discovery {
        source_name: &'static str,
        #[source]
        source: DiscoveryError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
