//! # Memoir
//!
//! A content-hash-addressed memory engine for AI assistants.
//!
//! Memoir stores text memories with embeddings and rich metadata (tags,
//! types, timestamps, quality scores) and exposes them through a single
//! async [`storage::MemoryStorage`] contract with three implementations:
//!
//! - a fast local `SQLite` vector store,
//! - a remote cloud adapter (metadata DB + vector index + blob store),
//! - a hybrid engine composing both with a background sync queue.
//!
//! ## Features
//!
//! - Content-hash identity (SHA-256) with duplicate detection
//! - Cosine k-NN retrieval with exact-match tag and time filtering
//! - Soft-delete tombstones with cross-backend deletion propagation
//! - Automatic chunking of oversized content with boundary preservation
//! - A consolidation engine: exponential-decay relevance, creative
//!   association discovery, DBSCAN clustering, controlled forgetting
//!
//! ## Example
//!
//! ```rust,ignore
//! use memoir::Config;
//! use memoir::services::{StoreRequest, get_or_create_service};
//!
//! let config = Config::load()?;
//! let service = get_or_create_service(&config).await?;
//! let outcome = service.store_memory(StoreRequest::new("Use WAL mode for SQLite")).await;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate
// transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod models;
pub mod observability;
pub mod quality;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{Config, GraphStorageMode, StorageBackend, SyncOwner};
pub use embedding::Embedder;
pub use models::{Association, Memory, MemoryQueryResult, RelationshipType, TagMatch};
pub use services::MemoryService;
pub use storage::MemoryStorage;

/// Error type for memoir operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait
/// implementations. Each variant maps onto a wire-level classification
/// (see [`ErrorKind`]) used by the service envelopes and by the hybrid
/// sync retry policy.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Validation` | Empty content, oversized tags, bad time expressions, wrong confirmation counts |
/// | `Duplicate` | Storing content whose hash already exists non-deleted |
/// | `Storage` | `SQLite` failures, remote network errors, lock timeouts |
/// | `Embedding` | Embedding model unavailable or dimension mismatch |
/// | `Limit` | Remote metadata size cap, vector index capacity, per-record content size |
/// | `Schema` | Migration failure, impossible schema version |
/// | `Unsupported` | Operation not available on the selected backend |
/// | `Unexpected` | Anything uncaught |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - Content is empty in a store request
    /// - A tag exceeds the 100-character limit
    /// - A natural time expression cannot be parsed
    /// - `delete_untagged_memories` is called with a stale count
    #[error("validation error: {0}")]
    Validation(String),

    /// Content with this hash already exists and is not deleted.
    ///
    /// This is a non-fatal outcome: callers receive the existing hash and
    /// nothing is rewritten.
    #[error("duplicate content: {content_hash}")]
    Duplicate {
        /// Hash of the already-stored content.
        content_hash: String,
    },

    /// A storage operation failed.
    ///
    /// Raised when:
    /// - `SQLite` statements fail or the database is locked past the
    ///   busy timeout
    /// - The remote service returns a transient error (timeout, 5xx, 429)
    /// - Filesystem I/O fails
    #[error("storage operation '{operation}' failed: {cause}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Embedding generation failed.
    ///
    /// Never silently coerced to a zero vector; surfaced to callers as a
    /// storage-class failure.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A hard resource limit was hit.
    ///
    /// Raised when:
    /// - Serialized vector metadata would exceed the remote per-record cap
    /// - The remote vector index is at capacity
    /// - Content exceeds the backend's declared maximum length
    ///
    /// Limit errors are permanent: the sync engine never retries them.
    #[error("limit: {0}")]
    Limit(String),

    /// Schema migration or versioning failed.
    ///
    /// Fatal to the current operation; the caller retries after operator
    /// intervention.
    #[error("schema error: {0}")]
    Schema(String),

    /// The operation is not supported by the selected backend.
    ///
    /// Raised when e.g. graph traversal is requested on the remote
    /// adapter, or sync control on a non-hybrid backend.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// An uncaught failure.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

/// Wire-level classification of an [`Error`].
///
/// Service envelopes expose this as the `error_kind` field; the hybrid
/// sync consumer uses it to separate retryable from permanent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller input was rejected; retrying without changes cannot succeed.
    Validation,
    /// The content already exists; not an error to the system.
    Duplicate,
    /// Storage-layer failure; retryable upstream.
    Storage,
    /// Hard resource limit; permanent, never retried.
    Limit,
    /// Schema-level failure; fatal to the current operation.
    Schema,
    /// Operation unavailable on this backend.
    Unsupported,
    /// Anything uncaught.
    Unexpected,
}

impl Error {
    /// Returns the wire-level classification for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::Storage { .. } | Self::Embedding(_) => ErrorKind::Storage,
            Self::Limit(_) => ErrorKind::Limit,
            Self::Schema(_) => ErrorKind::Schema,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether a background retry could plausibly succeed.
    ///
    /// Only storage-class failures are transient; validation, duplicate,
    /// limit, and schema failures are permanent by definition.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage)
    }

    /// Shorthand for an [`Error::Storage`] with an operation name.
    #[must_use]
    pub fn storage(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for memoir operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds, as a float.
///
/// Timestamps are floats end to end: sub-second precision matters for
/// `created_at`/`updated_at` ordering of rapid writes, and the sync
/// engine's clock-skew tolerance is expressed in fractional seconds.
/// Falls back to 0.0 if the system clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Validation("empty content".to_string());
        assert_eq!(err.to_string(), "validation error: empty content");

        let err = Error::Storage {
            operation: "store".to_string(),
            cause: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "storage operation 'store' failed: disk full"
        );

        let err = Error::Limit("metadata exceeds 10240 bytes".to_string());
        assert_eq!(err.to_string(), "limit: metadata exceeds 10240 bytes");
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            Error::Validation(String::new()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::Duplicate {
                content_hash: "ab".repeat(32)
            }
            .kind(),
            ErrorKind::Duplicate
        );
        assert_eq!(
            Error::Embedding("model missing".to_string()).kind(),
            ErrorKind::Storage
        );
        assert_eq!(Error::Limit(String::new()).kind(), ErrorKind::Limit);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::storage("sync", "connection reset").is_transient());
        assert!(!Error::Limit("index full".to_string()).is_transient());
        assert!(!Error::Validation("bad tag".to_string()).is_transient());
        assert!(!Error::Schema("version 99".to_string()).is_transient());
    }

    #[test]
    fn test_current_timestamp_is_recent() {
        let ts = current_timestamp();
        // 2023-01-01 as a sanity floor
        assert!(ts > 1_672_531_200.0);
    }
}
