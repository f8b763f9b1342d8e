//! Sync queue entries and status reporting for the hybrid engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Memory, MetadataPatch};
use crate::current_timestamp;

/// What a queued sync operation does on the secondary backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOpKind {
    /// Replicate a freshly stored memory.
    Store,
    /// Replicate a metadata update.
    UpdateMetadata,
    /// Replicate a soft delete.
    Delete,
}

impl SyncOpKind {
    /// Stable name used in logs and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::UpdateMetadata => "update_metadata",
            Self::Delete => "delete",
        }
    }
}

/// A single operation awaiting replication to the secondary backend.
///
/// Operations sharing a `content_hash` are applied in FIFO order; across
/// hashes the consumer is free to reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Queue-unique identifier, used in logs.
    pub id: Uuid,
    /// Operation kind.
    pub kind: SyncOpKind,
    /// Hash of the affected memory.
    pub content_hash: String,
    /// Full memory payload for `Store` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Box<Memory>>,
    /// Patch payload for `UpdateMetadata` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<MetadataPatch>,
    /// Delivery attempts so far.
    pub attempt_count: u32,
    /// Carry source timestamps verbatim (always true for replication;
    /// the secondary must not restamp `created_at`).
    pub preserve_timestamps: bool,
    /// When the operation entered the queue, float epoch seconds.
    pub enqueued_at: f64,
}

impl SyncOperation {
    /// Queues a full-memory replication.
    #[must_use]
    pub fn store(memory: Memory) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SyncOpKind::Store,
            content_hash: memory.content_hash.clone(),
            memory: Some(Box::new(memory)),
            patch: None,
            attempt_count: 0,
            preserve_timestamps: true,
            enqueued_at: current_timestamp(),
        }
    }

    /// Queues a metadata-patch replication.
    #[must_use]
    pub fn update_metadata(content_hash: impl Into<String>, patch: MetadataPatch) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SyncOpKind::UpdateMetadata,
            content_hash: content_hash.into(),
            memory: None,
            patch: Some(patch),
            attempt_count: 0,
            preserve_timestamps: true,
            enqueued_at: current_timestamp(),
        }
    }

    /// Queues a soft-delete replication.
    #[must_use]
    pub fn delete(content_hash: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SyncOpKind::Delete,
            content_hash: content_hash.into(),
            memory: None,
            patch: None,
            attempt_count: 0,
            preserve_timestamps: true,
            enqueued_at: current_timestamp(),
        }
    }
}

/// Snapshot of the hybrid engine's background sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the background consumer task is alive.
    pub running: bool,
    /// Whether dispatch and enqueue are paused.
    pub paused: bool,
    /// Whether a batch is being dispatched right now.
    pub actively_syncing: bool,
    /// Operations waiting in the queue.
    pub pending: usize,
    /// Operations that exhausted retries or hit a permanent error.
    pub failed: u64,
    /// Operations replicated successfully since startup.
    pub synced: u64,
    /// Timestamp of the last successful replication, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<f64>,
    /// Configured queue owner (`http`, `rpc`, or `both`).
    pub owner: String,
}
