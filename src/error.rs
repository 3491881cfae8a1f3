//! Error types for shardlog
//!
//! Provides a unified error type for all log storage operations.
//!
//! Invariant violations coming from the consensus engine above us are not
//! represented here: they are fatal and abort through [`invariant_violation`].

use std::path::PathBuf;

use thiserror::Error;

use crate::record::ReplicaId;

/// Result type alias using ShardLogError
pub type Result<T> = std::result::Result<T, ShardLogError>;

/// Unified error type for shardlog operations
#[derive(Debug, Error)]
pub enum ShardLogError {
    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    /// Nothing saved for the replica. Expected for never-written or removed
    /// replicas.
    #[error("{what} not found for {replica}")]
    NotFound {
        what: &'static str,
        replica: ReplicaId,
    },

    // -------------------------------------------------------------------------
    // Encoding Errors
    // -------------------------------------------------------------------------
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Unsupported binary format: {0}")]
    UnsupportedFormat(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage engine error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data directory is locked by another process: {}", .0.display())]
    DirLocked(PathBuf),

    #[error("Insufficient disk space in {}: {available} bytes available, {required} required", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardLogError {
    pub(crate) fn not_found(what: &'static str, group_id: u64, member_id: u64) -> Self {
        ShardLogError::NotFound {
            what,
            replica: ReplicaId::new(group_id, member_id),
        }
    }

    /// Whether this is the expected "nothing saved" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShardLogError::NotFound { .. })
    }

    /// Whether the underlying storage engine or filesystem failed
    pub fn is_storage_io(&self) -> bool {
        matches!(self, ShardLogError::Storage(_) | ShardLogError::Io(_))
    }
}

/// Abort on a broken contract with the consensus engine.
///
/// Persisting past one of these would silently lose data, so there is no
/// error path.
#[track_caller]
pub(crate) fn invariant_violation(msg: String) -> ! {
    tracing::error!("invariant violation: {}", msg);
    panic!("invariant violation: {}", msg);
}
