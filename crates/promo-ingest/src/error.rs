//! Error types for the promo-ingest pipeline

use std::path::PathBuf;
use std::time::Duration;

/// Errors reported by a membership store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The item is already present in the filter. Benign on bulk adds.
    #[error("item already exists")]
    AlreadyExists,
    /// The store did not answer within the per-call deadline
    #[error("store operation {op} timed out after {after:?}")]
    Timeout {
        /// Operation name (e.g. `BF.MADD`)
        op: &'static str,
        /// Deadline that elapsed
        after: Duration,
    },
    /// Could not reach the store
    #[error("store connection failed: {0}")]
    Connection(String),
    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for errors that must not abort a filter bulk-add.
    pub fn is_benign(&self) -> bool {
        matches!(self, StoreError::AlreadyExists)
    }
}

/// Which half of the two-tier store a flush failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStage {
    /// Probabilistic filter bulk-add
    Filter,
    /// Exact set bulk-add
    ExactSet,
}

impl std::fmt::Display for FlushStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushStage::Filter => f.write_str("filter"),
            FlushStage::ExactSet => f.write_str("exact set"),
        }
    }
}

/// All errors that can occur while ingesting promo code feeds
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Decompressing a gzip source failed (I/O or corrupt stream)
    #[error("failed to decompress {}: {source}", path.display())]
    Decompress {
        /// Gzip source path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// Reading a decompressed feed failed
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Decompressed feed path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// A feed line exceeded the configured maximum line size
    #[error("line {line} of {} exceeds {limit} bytes", path.display())]
    LineTooLong {
        /// Decompressed feed path
        path: PathBuf,
        /// 1-based line number
        line: u64,
        /// Configured limit in bytes
        limit: usize,
    },
    /// Writing a confirmed batch to the membership store failed
    #[error("flush to {stage} failed: {source}")]
    Flush {
        /// Which store tier failed
        stage: FlushStage,
        /// Backend error
        #[source]
        source: StoreError,
    },
    /// Store error outside of a flush (connect, query)
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Invalid configuration
    #[error("invalid config: {0}")]
    Config(String),
    /// Content-hash cache could not be written
    #[error("cache error: {0}")]
    Cache(String),
    /// A parse worker went away before reporting its result
    #[error("parse result channel closed with {missing} file(s) outstanding")]
    ChannelClosed {
        /// Files that never reported
        missing: usize,
    },
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Source file the error is attributed to, when there is one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            IngestError::Decompress { path, .. }
            | IngestError::Parse { path, .. }
            | IngestError::LineTooLong { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IngestError>;
