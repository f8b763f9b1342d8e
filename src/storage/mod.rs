//! Storage backends.
//!
//! One logical contract, three implementations:
//!
//! | Backend | Use Case | Characteristics |
//! |---------|----------|-----------------|
//! | [`sqlite::SqliteStorage`] | Local single-device | ~5 ms reads, WAL, single file |
//! | [`remote::RemoteStorage`] | Cloud-only | Durable, multi-device, size-limited |
//! | [`hybrid::HybridStorage`] | Production | Local primary + background-synced remote secondary |
//!
//! The memory service and the consolidation engine depend only on
//! [`MemoryStorage`]; backends are interchangeable behind
//! `Arc<dyn MemoryStorage>`.

pub mod hybrid;
pub mod remote;
pub mod sqlite;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::config::{Config, StorageBackend};
use crate::embedding::Embedder;
use crate::models::{
    Association, Direction, GraphPath, Memory, MemoryQueryResult, MetadataPatch, Subgraph,
    SyncStatus, TagMatch,
};
use crate::{Error, Result};

/// Aggregate statistics reported by every backend in the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    /// Backend name (`sqlite_vec`, `cloudflare`, `hybrid`).
    pub backend: String,
    /// Non-deleted memories.
    pub total_memories: usize,
    /// Memories created in the last seven days.
    pub memories_this_week: usize,
    /// Distinct tags across non-deleted memories.
    pub unique_tags: usize,
    /// On-disk size in bytes, when the backend knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_size_bytes: Option<u64>,
    /// Active embedding model name.
    pub embedding_model: String,
    /// Embedding dimensionality.
    pub embedding_dimension: usize,
}

/// The storage contract shared by local, remote, and hybrid backends.
///
/// Every operation excludes tombstoned rows unless documented otherwise;
/// synchronization code reaches tombstones through [`MemoryStorage::is_deleted`] and
/// [`MemoryStorage::get_memories_updated_since`]. Time windows are float UTC epoch
/// seconds.
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    /// Opens connections, runs migrations, prepares indices.
    ///
    /// Safe to call on an already-initialized database: existing schema is
    /// detected and DDL skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] when migrations fail, [`Error::Storage`]
    /// for I/O failures.
    async fn initialize(&self) -> Result<()>;

    /// Stable backend name for stats and logs.
    fn backend_name(&self) -> &'static str;

    /// Maximum content length this backend accepts, if limited.
    fn max_content_length(&self) -> Option<usize> {
        None
    }

    /// Whether callers may split oversized content into chunks.
    fn supports_chunking(&self) -> bool {
        true
    }

    /// Stores a new memory. The embedding is computed here when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Duplicate`] if a non-deleted row with the same
    /// hash exists; [`Error::Limit`] when the backend's size caps are
    /// exceeded; [`Error::Storage`] otherwise.
    async fn store(&self, memory: &Memory) -> Result<()>;

    /// Replaces the mutable fields of an existing memory.
    ///
    /// `created_at` is preserved from the stored row; `updated_at` is
    /// taken from the argument.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the row does not exist.
    async fn update_memory(&self, memory: &Memory) -> Result<()>;

    /// Applies many updates in one transaction.
    ///
    /// Returns one flag per input: `true` when the row existed and was
    /// updated. Orders of magnitude faster than sequential
    /// [`MemoryStorage::update_memory`] calls; consolidation relies on this.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails as a whole.
    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>>;

    /// Merges a metadata patch into a memory.
    ///
    /// With `preserve_timestamps` the stored `updated_at` advances to now;
    /// without it the patch's `updated_at` (or now) is used. `created_at`
    /// is never rewritten either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the row does not exist.
    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: &MetadataPatch,
        preserve_timestamps: bool,
    ) -> Result<Memory>;

    /// Soft-deletes a memory. Returns `false` when no non-deleted row
    /// matched (idempotent second call).
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    async fn delete(&self, content_hash: &str) -> Result<bool>;

    /// Soft-deletes all memories carrying the exact tag. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        self.delete_by_tags(std::slice::from_ref(&tag.to_string()), TagMatch::Any)
            .await
    }

    /// Soft-deletes by boolean tag combination. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn delete_by_tags(&self, tags: &[String], match_mode: TagMatch) -> Result<usize>;

    /// Soft-deletes inside a time window, optionally tag-filtered.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn delete_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<usize>;

    /// Soft-deletes everything created before `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn delete_before_date(&self, timestamp: f64, tag: Option<&str>) -> Result<usize> {
        self.delete_by_timeframe(0.0, timestamp, tag).await
    }

    /// Direct O(1) lookup; tombstoned rows come back as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>>;

    /// Exact content-text lookup (no embedding involved).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>>;

    /// Pages all non-deleted memories, newest first, embeddings included.
    ///
    /// The tag filter uses exact-match OR semantics at the database level.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_all_memories(
        &self,
        limit: usize,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>>;

    /// The `n` newest memories.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_recent_memories(&self, n: usize) -> Result<Vec<Memory>> {
        self.get_all_memories(n, 0, None, None).await
    }

    /// Database-level count of non-deleted rows matching the filters.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize>;

    /// Non-deleted rows with an empty tag set.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn count_untagged_memories(&self) -> Result<usize>;

    /// Soft-deletes rows with an empty tag set. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn delete_untagged_memories(&self) -> Result<usize>;

    /// Embeds the query and returns the `k` nearest memories by cosine
    /// distance, scored `1 - d/2`, best first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or embedding failure.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemoryQueryResult>>;

    /// Combined semantic and time-window query.
    ///
    /// With an empty query this degrades to most-recent-within-window.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or embedding failure.
    async fn recall(
        &self,
        query: Option<&str>,
        k: usize,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<MemoryQueryResult>>;

    /// Exact-match boolean tag search with an optional time window.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn search_by_tag(
        &self,
        tags: &[String],
        match_mode: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>>;

    /// All non-deleted memories created inside the window.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn search_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<Vec<Memory>>;

    /// `(hash, created_at, updated_at)` for every non-deleted row, in one
    /// query; analytics feed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_memory_timestamps(&self) -> Result<Vec<(String, f64, f64)>>;

    /// Rows (tombstones included) whose `updated_at` is strictly newer
    /// than `since`; drives drift detection. Uses the numeric index.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_memories_updated_since(&self, since: f64, limit: usize) -> Result<Vec<Memory>>;

    /// Every non-deleted hash, for O(1) bulk existence checks.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_all_content_hashes(&self) -> Result<HashSet<String>>;

    /// Aggregate statistics in the uniform shape.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn get_stats(&self) -> Result<StorageStats>;

    /// Whether the hash is present as a tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn is_deleted(&self, content_hash: &str) -> Result<bool>;

    /// Physically removes tombstones older than `older_than_days`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize>;

    /// Persists an association edge (both directions for symmetric types).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on backends without a graph table.
    async fn store_association(&self, association: &Association) -> Result<()> {
        let _ = association;
        Err(Error::Unsupported(format!(
            "graph storage on backend '{}'",
            self.backend_name()
        )))
    }

    /// Hashes reachable from `content_hash` within `max_hops`, paired with
    /// their hop distance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on backends without a graph table.
    async fn find_connected(
        &self,
        content_hash: &str,
        max_hops: usize,
        direction: Direction,
    ) -> Result<Vec<(String, usize)>> {
        let _ = (content_hash, max_hops, direction);
        Err(Error::Unsupported(format!(
            "graph traversal on backend '{}'",
            self.backend_name()
        )))
    }

    /// Shortest directed path between two memories, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on backends without a graph table.
    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<GraphPath>> {
        let _ = (from, to);
        Err(Error::Unsupported(format!(
            "graph traversal on backend '{}'",
            self.backend_name()
        )))
    }

    /// Neighborhood of edges and nodes within `radius` hops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on backends without a graph table.
    async fn get_subgraph(&self, content_hash: &str, radius: usize) -> Result<Subgraph> {
        let _ = (content_hash, radius);
        Err(Error::Unsupported(format!(
            "graph traversal on backend '{}'",
            self.backend_name()
        )))
    }

    /// Associations incident to `content_hash` (either direction).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on backends without a graph table.
    async fn get_associations(&self, content_hash: &str) -> Result<Vec<Association>> {
        let _ = content_hash;
        Err(Error::Unsupported(format!(
            "graph storage on backend '{}'",
            self.backend_name()
        )))
    }

    /// Background replication status, hybrid only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on non-hybrid backends.
    async fn sync_status(&self) -> Result<SyncStatus> {
        Err(Error::Unsupported(format!(
            "sync status on backend '{}'",
            self.backend_name()
        )))
    }

    /// Stops background workers and flushes connections.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type StorageCache = Mutex<HashMap<String, Arc<dyn MemoryStorage>>>;

/// Process-wide cache of constructed storage instances.
///
/// Keyed by `backend:path`. Construction (migrations, remote handshakes)
/// is expensive; hits are an `Arc` clone.
static STORAGE_CACHE: Lazy<StorageCache> = Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(config: &Config) -> String {
    format!(
        "{}:{}",
        config.backend.as_str(),
        config.sqlite_path.display()
    )
}

/// Builds (or fetches from the process-wide cache) the storage instance
/// selected by `config`.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the backend needs credentials the
/// config lacks, or any initialization error from the backend itself.
pub async fn create_storage(
    config: &Config,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn MemoryStorage>> {
    let key = cache_key(config);
    {
        let cache = STORAGE_CACHE
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(storage) = cache.get(&key) {
            metrics::counter!("storage_cache_hit_total").increment(1);
            return Ok(Arc::clone(storage));
        }
    }

    let storage: Arc<dyn MemoryStorage> = match config.backend {
        StorageBackend::SqliteVec => {
            Arc::new(sqlite::SqliteStorage::new(&config.sqlite_path, embedder, config)?)
        },
        StorageBackend::Cloudflare => {
            let cf = config.cloudflare.as_ref().ok_or_else(|| {
                Error::Validation("cloudflare backend selected without credentials".to_string())
            })?;
            Arc::new(remote::RemoteStorage::new(cf, embedder)?)
        },
        StorageBackend::Hybrid => {
            let cf = config.cloudflare.as_ref().ok_or_else(|| {
                Error::Validation("hybrid backend selected without credentials".to_string())
            })?;
            let primary = Arc::new(sqlite::SqliteStorage::new(
                &config.sqlite_path,
                Arc::clone(&embedder),
                config,
            )?);
            let secondary = Arc::new(remote::RemoteStorage::new(cf, embedder)?);
            Arc::new(hybrid::HybridStorage::new(primary, secondary, config))
        },
    };
    storage.initialize().await?;

    let mut cache = STORAGE_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let entry = cache.entry(key).or_insert_with(|| Arc::clone(&storage));
    Ok(Arc::clone(entry))
}

/// Drops all cached storage instances. Registered for process shutdown.
pub fn clear_storage_cache() {
    let mut cache = STORAGE_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    cache.clear();
}
