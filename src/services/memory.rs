//! The memory service: validation, normalization, chunking, and uniform
//! result envelopes.
//!
//! This is the single business-logic layer every protocol surface
//! (HTTP, JSON-RPC) shares. Public methods never return `Err` — every
//! outcome is an envelope with a `success` flag, so transport layers
//! serialize results without exception plumbing. Typed errors stay
//! internal.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::instrument;

use super::chunker::ContentSplitter;
use super::hasher::content_hash;
use super::tags::{merge_tag_sources, normalize_tags};
use super::timeparse::parse_time_expression;
use crate::config::{Config, StorageBackend};
use crate::embedding::Embedder;
use crate::models::{Memory, MemoryQueryResult, MetadataPatch, SyncStatus, TagMatch};
use crate::quality::{self, QualityProvider, QualityScore};
use crate::storage::MemoryStorage;
use crate::{Error, ErrorKind, Result};

/// Request shape for [`MemoryService::store_memory`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreRequest {
    /// The text to remember.
    pub content: String,
    /// Tags in any accepted shape (string, CSV string, array).
    #[serde(default)]
    pub tags: Option<Value>,
    /// Free-form type label.
    #[serde(default)]
    pub memory_type: Option<String>,
    /// Arbitrary metadata; `metadata.tags` is unioned into `tags`.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    /// Hostname of the originating client, when the server tags sources.
    #[serde(default)]
    pub client_hostname: Option<String>,
}

impl StoreRequest {
    /// Builds a plain request from content alone.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Envelope for store operations.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    /// Whether every record landed.
    pub success: bool,
    /// Hash of the stored memory (single) or of the first chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// The stored memory, single-record case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Box<Memory>>,
    /// `"duplicate"` when an identical non-deleted memory already exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of chunks created by auto-splitting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_created: Option<usize>,
    /// Hashes of all stored chunks, in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_hashes: Option<Vec<String>>,
    /// Failure reasons for chunks that did not land.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_chunks: Option<Vec<String>>,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StoreOutcome {
    fn failure(error: &Error) -> Self {
        Self {
            success: false,
            content_hash: None,
            memory: None,
            reason: None,
            chunks_created: None,
            chunk_hashes: None,
            failed_chunks: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    fn duplicate(hash: String) -> Self {
        Self {
            success: false,
            content_hash: Some(hash),
            memory: None,
            reason: Some("duplicate".to_string()),
            chunks_created: None,
            chunk_hashes: None,
            failed_chunks: None,
            error: None,
            error_kind: Some(ErrorKind::Duplicate),
        }
    }
}

/// Envelope for search-shaped operations; the payload key is always
/// `results` to match the REST contract.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    /// Whether the query ran.
    pub success: bool,
    /// Matches, best first.
    pub results: Vec<MemoryQueryResult>,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl SearchOutcome {
    fn ok(results: Vec<MemoryQueryResult>) -> Self {
        Self {
            success: true,
            results,
            error: None,
            error_kind: None,
        }
    }

    fn failure(error: &Error) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

/// Envelope for paged listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListOutcome {
    /// Whether the query ran.
    pub success: bool,
    /// The requested page, newest first.
    pub results: Vec<MemoryQueryResult>,
    /// 1-based page number.
    pub page: usize,
    /// Page size applied.
    pub page_size: usize,
    /// Total matching rows.
    pub total: usize,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Envelope for single-memory reads.
#[derive(Debug, Clone, Serialize)]
pub struct GetOutcome {
    /// Whether the memory was found.
    pub success: bool,
    /// The memory, when found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Box<Memory>>,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Envelope for delete operations.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    /// Whether the operation ran.
    pub success: bool,
    /// Rows soft-deleted.
    pub deleted_count: usize,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl DeleteOutcome {
    fn ok(deleted_count: usize) -> Self {
        Self {
            success: true,
            deleted_count,
            error: None,
            error_kind: None,
        }
    }

    fn failure(error: &Error) -> Self {
        Self {
            success: false,
            deleted_count: 0,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

/// Envelope for metadata updates.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    /// Whether the update landed.
    pub success: bool,
    /// The updated memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Box<Memory>>,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Envelope for counters.
#[derive(Debug, Clone, Serialize)]
pub struct CountOutcome {
    /// Whether the count ran.
    pub success: bool,
    /// The count.
    pub count: usize,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health envelope, uniform across backends.
#[derive(Debug, Clone, Serialize)]
pub struct HealthOutcome {
    /// Whether the backend answered.
    pub success: bool,
    /// Backend kind (`sqlite_vec`, `cloudflare`, `hybrid`).
    pub backend: String,
    /// Whether storage calls are succeeding.
    pub connected: bool,
    /// Non-deleted memories.
    pub total_memories: usize,
    /// On-disk size, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_size_bytes: Option<u64>,
    /// Active embedding model.
    pub embedding_model: String,
    /// Embedding dimensionality.
    pub embedding_dimension: usize,
    /// Service uptime in seconds.
    pub uptime_secs: u64,
    /// Replication state, hybrid backends only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    /// Error message, failure case only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata-update keys accepted by [`MemoryService::update_memory_metadata`].
const ALLOWED_UPDATE_KEYS: [&str; 3] = ["tags", "memory_type", "metadata"];
const QUALITY_UPDATE_KEYS: [&str; 4] = [
    "quality_score",
    "quality_provider",
    "quality_confidence",
    "quality_decision",
];

/// The shared business-logic layer over any storage backend.
pub struct MemoryService {
    storage: Arc<dyn MemoryStorage>,
    embedder: Arc<dyn Embedder>,
    config: Config,
    quality_provider: Arc<dyn QualityProvider>,
    started_at: Instant,
}

impl MemoryService {
    /// Composes a service over explicit collaborators.
    #[must_use]
    pub fn new(
        storage: Arc<dyn MemoryStorage>,
        embedder: Arc<dyn Embedder>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            embedder,
            config,
            quality_provider: Arc::new(quality::ImplicitQualityProvider::new()),
            started_at: Instant::now(),
        }
    }

    /// The storage behind this service.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn MemoryStorage> {
        &self.storage
    }

    /// Effective single-record length limit: the stricter of the backend
    /// cap and the embedder's declared input cap.
    fn effective_max_len(&self) -> Option<usize> {
        match (
            self.storage.max_content_length(),
            self.embedder.max_input_chars(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn hostname_fields(&self, request: &StoreRequest) -> Option<String> {
        if !self.config.include_hostname {
            return None;
        }
        request
            .client_hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
    }

    /// Stores content, splitting into chunks when it exceeds the
    /// effective limit.
    #[instrument(skip(self, request), fields(content_len = request.content.len()))]
    pub async fn store_memory(&self, request: StoreRequest) -> StoreOutcome {
        if request.content.trim().is_empty() {
            return StoreOutcome::failure(&Error::Validation(
                "content must not be empty".to_string(),
            ));
        }

        let mut metadata = request.metadata.clone().unwrap_or_default();
        let metadata_tags = metadata.remove("tags");
        let mut tags = match merge_tag_sources(request.tags.as_ref(), metadata_tags.as_ref()) {
            Ok(tags) => tags,
            Err(e) => return StoreOutcome::failure(&e),
        };

        if let Some(hostname) = self.hostname_fields(&request) {
            let source_tag = format!("source:{hostname}");
            if !tags.contains(&source_tag) {
                tags.push(source_tag);
            }
            metadata.insert("hostname".to_string(), json!(hostname));
        }

        let max_len = self.effective_max_len();
        let fits = max_len.is_none_or(|cap| request.content.chars().count() <= cap);

        if fits || !self.config.chunking.auto_split {
            return self
                .store_single(&request.content, tags, request.memory_type, metadata)
                .await;
        }

        #[allow(clippy::unwrap_used)] // !fits implies a cap is present
        let cap = max_len.unwrap();
        self.store_chunked(&request.content, tags, request.memory_type, metadata, cap)
            .await
    }

    async fn store_single(
        &self,
        content: &str,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: Map<String, Value>,
    ) -> StoreOutcome {
        let hash = content_hash(content, &tags, memory_type.as_deref());
        let memory = Memory::new(content, hash.clone(), tags, memory_type, metadata);
        match self.storage.store(&memory).await {
            Ok(()) => StoreOutcome {
                success: true,
                content_hash: Some(hash),
                memory: Some(Box::new(memory)),
                reason: None,
                chunks_created: None,
                chunk_hashes: None,
                failed_chunks: None,
                error: None,
                error_kind: None,
            },
            Err(Error::Duplicate { content_hash }) => StoreOutcome::duplicate(content_hash),
            Err(e) => {
                tracing::error!(error = %e, "store failed");
                StoreOutcome::failure(&e)
            },
        }
    }

    async fn store_chunked(
        &self,
        content: &str,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: Map<String, Value>,
        cap: usize,
    ) -> StoreOutcome {
        let splitter = ContentSplitter::new(
            cap,
            self.config.chunking.overlap,
            self.config.chunking.preserve_boundaries,
        );
        let chunks = splitter.split(content);
        let total = chunks.len();
        let original_length = content.chars().count();

        let mut chunk_hashes = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let ordinal = index + 1;
            let mut chunk_tags = tags.clone();
            chunk_tags.push(format!("chunk:{ordinal}/{total}"));
            let mut chunk_metadata = metadata.clone();
            chunk_metadata.insert("is_chunk".to_string(), json!(true));
            chunk_metadata.insert("chunk_index".to_string(), json!(ordinal));
            chunk_metadata.insert("total_chunks".to_string(), json!(total));
            chunk_metadata.insert("original_length".to_string(), json!(original_length));

            let hash = content_hash(chunk, &chunk_tags, memory_type.as_deref());
            let memory = Memory::new(
                chunk.clone(),
                hash.clone(),
                chunk_tags,
                memory_type.clone(),
                chunk_metadata,
            );
            match self.storage.store(&memory).await {
                Ok(()) => chunk_hashes.push(hash),
                Err(Error::Duplicate { content_hash }) => chunk_hashes.push(content_hash),
                Err(e) => {
                    // Already-stored chunks stay; the caller sees exactly
                    // which pieces are missing.
                    tracing::warn!(chunk = ordinal, total, error = %e, "chunk store failed");
                    failed.push(format!("chunk {ordinal}/{total}: {e}"));
                },
            }
        }

        metrics::counter!("store_chunked_total").increment(1);
        StoreOutcome {
            success: failed.is_empty(),
            content_hash: chunk_hashes.first().cloned(),
            memory: None,
            reason: None,
            chunks_created: Some(chunk_hashes.len()),
            chunk_hashes: Some(chunk_hashes),
            failed_chunks: if failed.is_empty() { None } else { Some(failed) },
            error: None,
            error_kind: None,
        }
    }

    /// Truncates a result list at memory boundaries to fit the response
    /// budget; 0 disables.
    fn apply_response_budget(&self, results: Vec<MemoryQueryResult>) -> Vec<MemoryQueryResult> {
        let budget = self.config.max_response_chars;
        if budget == 0 {
            return results;
        }
        let mut used = 0;
        let mut kept = Vec::new();
        for result in results {
            let cost = result.memory.content.chars().count();
            if !kept.is_empty() && used + cost > budget {
                break;
            }
            used += cost;
            kept.push(result);
        }
        kept
    }

    /// Best-effort access-count bump for retrieved memories; failures
    /// never surface to the search path.
    async fn touch_access_counts(&self, results: &[MemoryQueryResult]) {
        let mut updated = Vec::with_capacity(results.len());
        for result in results {
            let mut memory = result.memory.clone();
            let count = memory.metadata_u64("access_count").unwrap_or(0) + 1;
            memory.metadata.insert("access_count".to_string(), json!(count));
            memory.metadata.insert(
                "last_accessed_at".to_string(),
                json!(crate::current_timestamp()),
            );
            memory.touch();
            updated.push(memory);
        }
        if let Err(e) = self.storage.update_memories_batch(&updated).await {
            tracing::debug!(error = %e, "access-count update skipped");
        }
    }

    /// Semantic retrieval.
    #[instrument(skip(self))]
    pub async fn retrieve_memories(&self, query: &str, n: usize) -> SearchOutcome {
        if query.trim().is_empty() {
            return SearchOutcome::failure(&Error::Validation(
                "query must not be empty".to_string(),
            ));
        }
        match self.storage.retrieve(query, n.max(1)).await {
            Ok(results) => {
                let results = self.apply_response_budget(results);
                self.touch_access_counts(&results).await;
                SearchOutcome::ok(results)
            },
            Err(e) => SearchOutcome::failure(&e),
        }
    }

    /// Semantic retrieval with an opt-in quality re-rank.
    ///
    /// When `quality_boost` is set, three times the requested results
    /// are fetched and re-ranked by
    /// `(1 - w) * semantic + w * quality_score`; memories without a
    /// quality score rank on semantics alone. Off by default.
    pub async fn search_memories(
        &self,
        query: &str,
        n: usize,
        quality_boost: bool,
        quality_weight: Option<f32>,
    ) -> SearchOutcome {
        if !quality_boost {
            return self.retrieve_memories(query, n).await;
        }
        let weight = quality_weight.unwrap_or(quality::DEFAULT_QUALITY_WEIGHT);
        let fetch = n.max(1).saturating_mul(3);
        match self.storage.retrieve(query, fetch).await {
            Ok(mut results) => {
                #[allow(clippy::cast_possible_truncation)]
                let composite = |r: &MemoryQueryResult| {
                    let semantic = r.similarity_score.unwrap_or(0.0);
                    let quality =
                        r.memory.metadata_f64("quality_score").unwrap_or(0.0) as f32;
                    quality::composite_score(semantic, quality, weight)
                };
                results.sort_by(|a, b| {
                    composite(b)
                        .partial_cmp(&composite(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results.truncate(n.max(1));
                let results = self.apply_response_budget(results);
                self.touch_access_counts(&results).await;
                SearchOutcome::ok(results)
            },
            Err(e) => SearchOutcome::failure(&e),
        }
    }

    /// Combined semantic and time-window recall.
    pub async fn recall_memories(
        &self,
        query: Option<&str>,
        n: usize,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> SearchOutcome {
        match self
            .storage
            .recall(query, n.max(1), time_start, time_end)
            .await
        {
            Ok(results) => SearchOutcome::ok(self.apply_response_budget(results)),
            Err(e) => SearchOutcome::failure(&e),
        }
    }

    /// Exact-match boolean tag search.
    pub async fn search_by_tag(
        &self,
        tags: Option<&Value>,
        operation: Option<&str>,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> SearchOutcome {
        let normalized = match normalize_tags(tags) {
            Ok(tags) if !tags.is_empty() => tags,
            Ok(_) => {
                return SearchOutcome::failure(&Error::Validation(
                    "at least one tag is required".to_string(),
                ));
            },
            Err(e) => return SearchOutcome::failure(&e),
        };
        let match_mode = match operation {
            None => TagMatch::Any,
            Some(op) => match TagMatch::parse(op) {
                Some(mode) => mode,
                None => {
                    return SearchOutcome::failure(&Error::Validation(format!(
                        "operation must be AND/OR (or all/any), got '{op}'"
                    )));
                },
            },
        };

        match self
            .storage
            .search_by_tag(&normalized, match_mode, time_start, time_end)
            .await
        {
            Ok(memories) => SearchOutcome::ok(
                memories
                    .into_iter()
                    .map(|memory| MemoryQueryResult {
                        memory,
                        similarity_score: None,
                        distance: None,
                    })
                    .collect(),
            ),
            Err(e) => SearchOutcome::failure(&e),
        }
    }

    /// Recall scoped by a natural time expression (`"last week"`,
    /// `"3 days ago"`, `"2024-01-15"`).
    pub async fn search_by_time(&self, query: &str, n: usize) -> SearchOutcome {
        let (start, end) = match parse_time_expression(query, Utc::now()) {
            Ok(window) => window,
            Err(e) => return SearchOutcome::failure(&e),
        };
        self.recall_memories(Some(query), n, Some(start), Some(end))
            .await
    }

    /// Direct O(1) lookup by hash.
    pub async fn get_memory_by_hash(&self, content_hash: &str) -> GetOutcome {
        match self.storage.get_by_hash(content_hash).await {
            Ok(Some(memory)) => GetOutcome {
                success: true,
                memory: Some(Box::new(memory)),
                error: None,
            },
            Ok(None) => GetOutcome {
                success: false,
                memory: None,
                error: Some(format!("memory not found: {content_hash}")),
            },
            Err(e) => GetOutcome {
                success: false,
                memory: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Paged chronological listing.
    pub async fn list_memories(
        &self,
        page: usize,
        page_size: usize,
        tag: Option<&str>,
        memory_type: Option<&str>,
    ) -> ListOutcome {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let tags: Option<Vec<String>> = tag.map(|t| vec![t.to_string()]);

        let total = match self
            .storage
            .count_all_memories(memory_type, tags.as_deref())
            .await
        {
            Ok(total) => total,
            Err(e) => {
                return ListOutcome {
                    success: false,
                    results: Vec::new(),
                    page,
                    page_size,
                    total: 0,
                    error: Some(e.to_string()),
                };
            },
        };

        match self
            .storage
            .get_all_memories(page_size, (page - 1) * page_size, memory_type, tags.as_deref())
            .await
        {
            Ok(memories) => ListOutcome {
                success: true,
                results: memories
                    .into_iter()
                    .map(|memory| MemoryQueryResult {
                        memory,
                        similarity_score: None,
                        distance: None,
                    })
                    .collect(),
                page,
                page_size,
                total,
                error: None,
            },
            Err(e) => ListOutcome {
                success: false,
                results: Vec::new(),
                page,
                page_size,
                total,
                error: Some(e.to_string()),
            },
        }
    }

    /// Soft-deletes one memory.
    #[instrument(skip(self))]
    pub async fn delete_memory(&self, content_hash: &str) -> DeleteOutcome {
        match self.storage.delete(content_hash).await {
            Ok(true) => DeleteOutcome::ok(1),
            Ok(false) => DeleteOutcome {
                success: false,
                deleted_count: 0,
                error: Some(format!("memory not found: {content_hash}")),
                error_kind: None,
            },
            Err(e) => DeleteOutcome::failure(&e),
        }
    }

    /// Soft-deletes by tag combination.
    pub async fn delete_by_tags(&self, tags: Option<&Value>, operation: Option<&str>) -> DeleteOutcome {
        let normalized = match normalize_tags(tags) {
            Ok(tags) if !tags.is_empty() => tags,
            Ok(_) => {
                return DeleteOutcome::failure(&Error::Validation(
                    "at least one tag is required".to_string(),
                ));
            },
            Err(e) => return DeleteOutcome::failure(&e),
        };
        let match_mode = operation
            .and_then(TagMatch::parse)
            .unwrap_or(TagMatch::Any);
        match self.storage.delete_by_tags(&normalized, match_mode).await {
            Ok(count) => DeleteOutcome::ok(count),
            Err(e) => DeleteOutcome::failure(&e),
        }
    }

    /// Soft-deletes inside a time window.
    pub async fn delete_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> DeleteOutcome {
        if time_end < time_start {
            return DeleteOutcome::failure(&Error::Validation(
                "time_end must not precede time_start".to_string(),
            ));
        }
        match self
            .storage
            .delete_by_timeframe(time_start, time_end, tag)
            .await
        {
            Ok(count) => DeleteOutcome::ok(count),
            Err(e) => DeleteOutcome::failure(&e),
        }
    }

    /// Soft-deletes everything created before `timestamp`.
    pub async fn delete_before_date(&self, timestamp: f64, tag: Option<&str>) -> DeleteOutcome {
        match self.storage.delete_before_date(timestamp, tag).await {
            Ok(count) => DeleteOutcome::ok(count),
            Err(e) => DeleteOutcome::failure(&e),
        }
    }

    /// Applies a metadata patch. Only `tags`, `memory_type`, `metadata`,
    /// and quality fields are accepted; anything else is rejected so
    /// callers cannot smuggle in immutable fields.
    #[instrument(skip(self, updates))]
    pub async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &Map<String, Value>,
        preserve_timestamps: bool,
    ) -> UpdateOutcome {
        for key in updates.keys() {
            if !ALLOWED_UPDATE_KEYS.contains(&key.as_str())
                && !QUALITY_UPDATE_KEYS.contains(&key.as_str())
            {
                return UpdateOutcome {
                    success: false,
                    memory: None,
                    error: Some(format!("field '{key}' is not updatable")),
                    error_kind: Some(ErrorKind::Validation),
                };
            }
        }

        let tags = match updates.get("tags") {
            Some(value) => match normalize_tags(Some(value)) {
                Ok(tags) => Some(tags),
                Err(e) => {
                    return UpdateOutcome {
                        success: false,
                        memory: None,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                    };
                },
            },
            None => None,
        };

        let mut metadata = updates
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for key in QUALITY_UPDATE_KEYS {
            if let Some(value) = updates.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }

        let patch = MetadataPatch {
            tags,
            memory_type: updates
                .get("memory_type")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            metadata: if metadata.is_empty() { None } else { Some(metadata) },
            updated_at: None,
        };
        if patch.is_empty() {
            return UpdateOutcome {
                success: false,
                memory: None,
                error: Some("no updatable fields in request".to_string()),
                error_kind: Some(ErrorKind::Validation),
            };
        }

        match self
            .storage
            .update_memory_metadata(content_hash, &patch, preserve_timestamps)
            .await
        {
            Ok(memory) => UpdateOutcome {
                success: true,
                memory: Some(Box::new(memory)),
                error: None,
                error_kind: None,
            },
            Err(e) => UpdateOutcome {
                success: false,
                memory: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
            },
        }
    }

    /// Counts memories with no tags at all.
    pub async fn count_untagged_memories(&self) -> CountOutcome {
        match self.storage.count_untagged_memories().await {
            Ok(count) => CountOutcome {
                success: true,
                count,
                error: None,
            },
            Err(e) => CountOutcome {
                success: false,
                count: 0,
                error: Some(e.to_string()),
            },
        }
    }

    /// Bulk-deletes untagged memories, gated by an exact count
    /// confirmation so a stale dashboard cannot mass-delete by accident.
    pub async fn delete_untagged_memories(&self, confirm_count: Option<usize>) -> DeleteOutcome {
        let Some(confirm) = confirm_count else {
            return DeleteOutcome::failure(&Error::Validation(
                "confirm_count is required for bulk deletion".to_string(),
            ));
        };
        let current = match self.storage.count_untagged_memories().await {
            Ok(count) => count,
            Err(e) => return DeleteOutcome::failure(&e),
        };
        if confirm != current {
            return DeleteOutcome::failure(&Error::Validation(format!(
                "confirm_count {confirm} does not match current untagged count {current}"
            )));
        }
        match self.storage.delete_untagged_memories().await {
            Ok(count) => DeleteOutcome::ok(count),
            Err(e) => DeleteOutcome::failure(&e),
        }
    }

    /// Records a caller-supplied quality rating.
    pub async fn rate_memory(
        &self,
        content_hash: &str,
        rating: f64,
        feedback: Option<&str>,
    ) -> UpdateOutcome {
        if !(0.0..=1.0).contains(&rating) {
            return UpdateOutcome {
                success: false,
                memory: None,
                error: Some("rating must be within [0, 1]".to_string()),
                error_kind: Some(ErrorKind::Validation),
            };
        }
        let mut updates = Map::new();
        updates.insert("quality_score".to_string(), json!(rating));
        updates.insert("quality_provider".to_string(), json!("external"));
        updates.insert("quality_confidence".to_string(), json!(1.0));
        if let Some(feedback) = feedback {
            let mut metadata = Map::new();
            metadata.insert("quality_feedback".to_string(), json!(feedback));
            updates.insert("metadata".to_string(), Value::Object(metadata));
        }
        self.update_memory_metadata(content_hash, &updates, true)
            .await
    }

    /// Computes and stores an implicit quality assessment.
    pub async fn evaluate_memory_quality(&self, content_hash: &str) -> UpdateOutcome {
        let memory = match self.storage.get_by_hash(content_hash).await {
            Ok(Some(memory)) => memory,
            Ok(None) => {
                return UpdateOutcome {
                    success: false,
                    memory: None,
                    error: Some(format!("memory not found: {content_hash}")),
                    error_kind: Some(ErrorKind::Storage),
                };
            },
            Err(e) => {
                return UpdateOutcome {
                    success: false,
                    memory: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                };
            },
        };

        let assessment: QualityScore = match self.quality_provider.score(&memory) {
            Ok(assessment) => assessment,
            Err(e) => {
                return UpdateOutcome {
                    success: false,
                    memory: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                };
            },
        };

        let mut scored = memory;
        quality::record_quality(&mut scored, &assessment);
        scored.touch();
        match self.storage.update_memory(&scored).await {
            Ok(()) => UpdateOutcome {
                success: true,
                memory: Some(Box::new(scored)),
                error: None,
                error_kind: None,
            },
            Err(e) => UpdateOutcome {
                success: false,
                memory: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
            },
        }
    }

    /// Backend health plus embedding and replication info.
    pub async fn health_check(&self) -> HealthOutcome {
        let uptime_secs = self.started_at.elapsed().as_secs();
        match self.storage.get_stats().await {
            Ok(stats) => {
                let sync_status = if self.config.backend == StorageBackend::Hybrid {
                    self.storage.sync_status().await.ok()
                } else {
                    None
                };
                HealthOutcome {
                    success: true,
                    backend: stats.backend,
                    connected: true,
                    total_memories: stats.total_memories,
                    database_size_bytes: stats.database_size_bytes,
                    embedding_model: stats.embedding_model,
                    embedding_dimension: stats.embedding_dimension,
                    uptime_secs,
                    sync_status,
                    error: None,
                }
            },
            Err(e) => HealthOutcome {
                success: false,
                backend: self.storage.backend_name().to_string(),
                connected: false,
                total_memories: 0,
                database_size_bytes: None,
                embedding_model: self.embedder.model_name().to_string(),
                embedding_dimension: self.embedder.dimensions(),
                uptime_secs,
                sync_status: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stops background work and closes storage connections.
    ///
    /// # Errors
    ///
    /// Returns the storage error from closing, if any.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("memory service shutting down");
        self.storage.close().await
    }
}
