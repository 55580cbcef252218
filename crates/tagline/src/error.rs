//! Error and Result types for Tagline operations.

use crate::tag::EntityId;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Tagline operations.
pub type Result<T> = std::result::Result<T, TagError>;

/// The error type for tag store operations.
#[derive(Debug, Error)]
pub enum TagError {
    /// No live entity has the given id.
    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    /// A supplied timestamp is malformed or would break per-key ordering.
    #[error("Invalid timestamp for key '{key}': {reason}")]
    InvalidTimestamp {
        /// Tag key the timestamp was supplied for (empty when unknown).
        key: String,
        /// Why the timestamp was rejected.
        reason: String,
    },

    /// A tag could not be parsed or uses a reserved character.
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// The entity's write section stayed contended past the retry budget.
    #[error("Concurrent modification of entity {entity_id}: gave up after {attempts} attempts")]
    ConcurrentModification {
        /// Entity whose lock could not be acquired.
        entity_id: EntityId,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// No retention policy could be resolved for an entity.
    #[error("Retention violation: {0}")]
    RetentionViolation(String),

    /// The shard's WAL or checkpoint failed; the shard no longer accepts writes.
    #[error("Storage I/O error on shard {shard}: {reason}")]
    StorageIo {
        /// Shard that failed.
        shard: usize,
        /// Description of the underlying failure.
        reason: String,
    },

    /// A read was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// A read ran past its caller-supplied deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Invalid magic bytes in a WAL segment or checkpoint header.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Record checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A persisted record could not be decoded.
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TagError {
    /// Returns true if retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    pub(crate) fn invalid_timestamp(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
