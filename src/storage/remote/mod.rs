//! Remote cloud storage adapter.
//!
//! Implements the storage contract over a remote service composed of a
//! SQL metadata DB, a vector index, and an optional blob bucket. The
//! adapter is deliberately strict about what it sends:
//!
//! - vector ids are the raw 64-char content hash (the service rejects
//!   longer ids),
//! - vector metadata is pre-sized locally against the 10 KB cap, with
//!   quality fields CSV-compressed first,
//! - content above the declared `max_content_length` is rejected here
//!   (splitting is the memory service's job), except that content past
//!   the 1 MiB blob threshold moves to the blob bucket when one is
//!   configured, leaving a keyed reference in the metadata row that is
//!   rehydrated on read,
//! - deletes are soft (a metadata update), so a peer's initial sync can
//!   never resurrect a deleted memory,
//! - every query filters `deleted_at IS NULL` at the source.

mod client;
mod limits;

pub use client::{FailureClass, RemoteClient, VectorMatch, backoff_delay, classify_status};
pub use limits::{
    CapacityTracker, DEFAULT_INDEX_CAPACITY, DEFAULT_MAX_CONTENT_LENGTH,
    MAX_VECTOR_METADATA_BYTES, check_metadata_size, metadata_size_bytes,
};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::CloudflareConfig;
use crate::embedding::{Embedder, score_from_distance};
use crate::models::{
    Memory, MemoryQueryResult, MetadataPatch, TagMatch, iso_from_timestamp,
};
use crate::quality::codec;
use crate::storage::sqlite::{build_tag_clause, csv_to_tags, tags_to_csv};
use crate::storage::{MemoryStorage, StorageStats};
use crate::{Error, Result, current_timestamp};

const SELECT_COLUMNS: &str = "content_hash, content, tags_csv, memory_type, metadata_json, \
     created_at, created_at_iso, updated_at, updated_at_iso, deleted_at";

/// Content above this many bytes moves to the blob bucket; the metadata
/// DB row then holds a reference instead of the text.
pub const BLOB_OFFLOAD_THRESHOLD_BYTES: usize = 1_048_576;

/// Marker prefix stored in the content column for offloaded rows.
const BLOB_MARKER_PREFIX: &str = "r2://";

/// Where a piece of content lands on this backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentDisposition {
    /// Fits the embedding cap; stored inline in the metadata DB.
    Inline,
    /// Over the blob threshold with a bucket configured; content goes to
    /// the blob store, the row keeps a reference.
    Offload,
    /// Oversized with nowhere to put it; the caller must split.
    Reject,
}

/// Decides how content is persisted.
///
/// Two independent caps apply: the embedding cap (callers chunk past
/// it) and the blob threshold (rows past it cannot live in the metadata
/// DB at all). Between the two, rejection is correct — the memory
/// service splits such content before it ever reaches this adapter.
fn content_disposition(
    content: &str,
    max_content_length: usize,
    blob_store_available: bool,
) -> ContentDisposition {
    if content.chars().count() <= max_content_length {
        ContentDisposition::Inline
    } else if blob_store_available && content.len() > BLOB_OFFLOAD_THRESHOLD_BYTES {
        ContentDisposition::Offload
    } else {
        ContentDisposition::Reject
    }
}

/// Renders the row marker for an offloaded blob.
fn blob_marker(content_hash: &str) -> String {
    format!("{BLOB_MARKER_PREFIX}{content_hash}")
}

/// Extracts the blob key from a row marker, if the content is one.
///
/// Keys are exactly 64 hex chars, so ordinary content that merely
/// starts with the prefix never false-positives.
fn blob_key(content: &str) -> Option<&str> {
    let key = content.strip_prefix(BLOB_MARKER_PREFIX)?;
    (key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit())).then_some(key)
}

/// The remote storage backend.
pub struct RemoteStorage {
    client: RemoteClient,
    embedder: Arc<dyn Embedder>,
    capacity: CapacityTracker,
    max_content_length: usize,
}

impl RemoteStorage {
    /// Builds the adapter from credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the HTTP client cannot be built.
    pub fn new(config: &CloudflareConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let client = RemoteClient::new(config)?;
        if client.r2_bucket().is_some() {
            tracing::info!(
                threshold_bytes = BLOB_OFFLOAD_THRESHOLD_BYTES,
                "blob offload enabled for oversized content"
            );
        }
        Ok(Self {
            client,
            embedder,
            capacity: CapacityTracker::new(DEFAULT_INDEX_CAPACITY),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        })
    }

    /// Metadata attached to a vector: the query-relevant subset, with
    /// quality fields compressed. Sized against the cap before upload.
    fn vector_metadata(memory: &Memory) -> Result<Map<String, Value>> {
        let mut metadata = memory.metadata.clone();
        codec::compact_in_place(&mut metadata);
        metadata.insert("tags_csv".to_string(), json!(tags_to_csv(&memory.tags)));
        if let Some(memory_type) = &memory.memory_type {
            metadata.insert("memory_type".to_string(), json!(memory_type));
        }
        metadata.insert("created_at".to_string(), json!(memory.created_at));
        check_metadata_size(&metadata)?;
        Ok(metadata)
    }

    async fn fetch_where(
        &self,
        operation: &str,
        clause: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Memory>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE {clause}");
        let rows = self.client.d1_query(&sql, params).await.map_err(|e| {
            tracing::warn!(operation, error = %e, "remote read failed");
            e
        })?;
        let mut memories: Vec<Memory> = rows.iter().map(memory_from_remote_row).collect();
        for memory in &mut memories {
            self.rehydrate_blob(memory).await?;
        }
        Ok(memories)
    }

    /// Replaces a blob marker with the stored content.
    async fn rehydrate_blob(&self, memory: &mut Memory) -> Result<()> {
        let Some(key) = blob_key(&memory.content) else {
            return Ok(());
        };
        let bytes = self.client.r2_get(key).await?;
        memory.content = String::from_utf8(bytes)
            .map_err(|e| Error::storage("rehydrate_blob", e))?;
        Ok(())
    }

    async fn count_where(&self, clause: &str, params: Vec<Value>) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) AS n FROM memories WHERE {clause}");
        let rows = self.client.d1_query(&sql, params).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }
}

/// Converts a metadata-DB row (JSON object) into a [`Memory`].
///
/// Quality fields arrive CSV-compressed and are restored inline.
fn memory_from_remote_row(row: &Map<String, Value>) -> Memory {
    let f64_of = |key: &str| row.get(key).and_then(Value::as_f64);
    let str_of =
        |key: &str| row.get(key).and_then(Value::as_str).map(ToString::to_string);

    let mut metadata: Map<String, Value> = str_of("metadata_json")
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    codec::restore_in_place(&mut metadata);

    let created_at = f64_of("created_at").unwrap_or(0.0);
    let updated_at = f64_of("updated_at").unwrap_or(created_at);

    Memory {
        content_hash: str_of("content_hash").unwrap_or_default(),
        content: str_of("content").unwrap_or_default(),
        tags: csv_to_tags(&str_of("tags_csv").unwrap_or_default()),
        memory_type: str_of("memory_type"),
        metadata,
        embedding: None,
        created_at,
        created_at_iso: str_of("created_at_iso").unwrap_or_else(|| iso_from_timestamp(created_at)),
        updated_at,
        updated_at_iso: str_of("updated_at_iso").unwrap_or_else(|| iso_from_timestamp(updated_at)),
        deleted_at: f64_of("deleted_at"),
    }
}

#[async_trait]
impl MemoryStorage for RemoteStorage {
    async fn initialize(&self) -> Result<()> {
        self.client
            .d1_query(
                "CREATE TABLE IF NOT EXISTS memories (
                    content_hash TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    tags_csv TEXT NOT NULL DEFAULT '',
                    memory_type TEXT,
                    metadata_json TEXT NOT NULL DEFAULT '{}',
                    created_at REAL NOT NULL,
                    created_at_iso TEXT NOT NULL,
                    updated_at REAL NOT NULL,
                    updated_at_iso TEXT NOT NULL,
                    deleted_at REAL
                )",
                vec![],
            )
            .await?;
        let used = self.client.vectorize_count().await.unwrap_or(0);
        self.capacity.seed(used);
        tracing::info!(vectors = used, "remote storage initialized");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "cloudflare"
    }

    fn max_content_length(&self) -> Option<usize> {
        Some(self.max_content_length)
    }

    async fn store(&self, memory: &Memory) -> Result<()> {
        let disposition = content_disposition(
            &memory.content,
            self.max_content_length,
            self.client.r2_bucket().is_some(),
        );
        if disposition == ContentDisposition::Reject {
            return Err(Error::Limit(format!(
                "content is {} chars, backend cap is {}; split before storing \
                 (blob offload applies past {BLOB_OFFLOAD_THRESHOLD_BYTES} bytes)",
                memory.content.chars().count(),
                self.max_content_length
            )));
        }

        let live = self
            .count_where(
                "content_hash = ?1 AND deleted_at IS NULL",
                vec![json!(memory.content_hash)],
            )
            .await?;
        if live > 0 {
            return Err(Error::Duplicate {
                content_hash: memory.content_hash.clone(),
            });
        }

        let row_content = if disposition == ContentDisposition::Offload {
            self.client
                .r2_put(&memory.content_hash, memory.content.as_bytes())
                .await?;
            metrics::counter!("blob_offload_total").increment(1);
            blob_marker(&memory.content_hash)
        } else {
            memory.content.clone()
        };

        let embedding = match &memory.embedding {
            Some(vector) => vector.clone(),
            None => {
                // Offloaded content is embedded by its head: the vector is
                // a retrieval surrogate, the blob holds the full text.
                let surrogate: String = memory
                    .content
                    .chars()
                    .take(self.max_content_length)
                    .collect();
                self.embedder.embed(&surrogate).await?
            },
        };
        let vector_metadata = Self::vector_metadata(memory)?;
        self.capacity.reserve(1)?;

        self.client
            .d1_query(
                "INSERT OR REPLACE INTO memories
                 (content_hash, content, tags_csv, memory_type, metadata_json,
                  created_at, created_at_iso, updated_at, updated_at_iso, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
                vec![
                    json!(memory.content_hash),
                    json!(row_content),
                    json!(tags_to_csv(&memory.tags)),
                    json!(memory.memory_type),
                    json!(Value::Object(memory.metadata.clone()).to_string()),
                    json!(memory.created_at),
                    json!(memory.created_at_iso),
                    json!(memory.updated_at),
                    json!(memory.updated_at_iso),
                ],
            )
            .await?;

        self.client
            .vectorize_upsert(&[(memory.content_hash.clone(), embedding, vector_metadata)])
            .await
    }

    async fn update_memory(&self, memory: &Memory) -> Result<()> {
        self.client
            .d1_query(
                "UPDATE memories SET tags_csv = ?1, memory_type = ?2, metadata_json = ?3,
                 updated_at = ?4, updated_at_iso = ?5
                 WHERE content_hash = ?6",
                vec![
                    json!(tags_to_csv(&memory.tags)),
                    json!(memory.memory_type),
                    json!(Value::Object(memory.metadata.clone()).to_string()),
                    json!(memory.updated_at),
                    json!(memory.updated_at_iso),
                    json!(memory.content_hash),
                ],
            )
            .await
            .map(|_| ())
    }

    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        // The metadata DB API has no multi-statement transaction surface;
        // updates go out sequentially and report per-item success.
        let mut outcomes = Vec::with_capacity(memories.len());
        for memory in memories {
            outcomes.push(self.update_memory(memory).await.is_ok());
        }
        Ok(outcomes)
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: &MetadataPatch,
        preserve_timestamps: bool,
    ) -> Result<Memory> {
        let mut memory = self
            .get_by_hash(content_hash)
            .await?
            .ok_or_else(|| {
                Error::storage(
                    "update_memory_metadata",
                    format!("memory not found: {content_hash}"),
                )
            })?;

        if let Some(tags) = &patch.tags {
            memory.tags.clone_from(tags);
        }
        if let Some(memory_type) = &patch.memory_type {
            memory.memory_type = Some(memory_type.clone());
        }
        if let Some(meta) = &patch.metadata {
            for (key, value) in meta {
                memory.metadata.insert(key.clone(), value.clone());
            }
        }
        if preserve_timestamps {
            memory.touch();
        } else {
            memory.updated_at = patch.updated_at.unwrap_or_else(current_timestamp);
            memory.updated_at_iso = iso_from_timestamp(memory.updated_at);
        }

        self.update_memory(&memory).await?;
        Ok(memory)
    }

    async fn delete(&self, content_hash: &str) -> Result<bool> {
        // Soft delete only: the row must stay visible to peers' sync so
        // the deletion propagates instead of the memory resurrecting.
        let live = self
            .count_where(
                "content_hash = ?1 AND deleted_at IS NULL",
                vec![json!(content_hash)],
            )
            .await?;
        if live == 0 {
            return Ok(false);
        }
        let now = current_timestamp();
        self.client
            .d1_query(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1, updated_at_iso = ?2
                 WHERE content_hash = ?3 AND deleted_at IS NULL",
                vec![json!(now), json!(iso_from_timestamp(now)), json!(content_hash)],
            )
            .await?;
        Ok(true)
    }

    async fn delete_by_tags(&self, tags: &[String], match_mode: TagMatch) -> Result<usize> {
        let (clause, tag_params) = build_tag_clause(tags, match_mode, 3);
        if clause.is_empty() {
            return Ok(0);
        }
        let before = self
            .count_where(
                &format!("deleted_at IS NULL AND {clause}"),
                tag_params.iter().map(|p| json!(p)).collect(),
            )
            .await?;
        let now = current_timestamp();
        let mut params = vec![json!(now), json!(iso_from_timestamp(now))];
        params.extend(tag_params.iter().map(|p| json!(p)));
        self.client
            .d1_query(
                &format!(
                    "UPDATE memories SET deleted_at = ?1, updated_at = ?1, updated_at_iso = ?2
                     WHERE deleted_at IS NULL AND {clause}"
                ),
                params,
            )
            .await?;
        Ok(before)
    }

    async fn delete_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<usize> {
        let mut clause = "deleted_at IS NULL AND created_at >= ?3 AND created_at <= ?4".to_string();
        let mut tag_params: Vec<Value> = Vec::new();
        if let Some(tag) = tag {
            let (tag_clause, params) =
                build_tag_clause(std::slice::from_ref(&tag.to_string()), TagMatch::Any, 5);
            if !tag_clause.is_empty() {
                clause.push_str(" AND ");
                clause.push_str(&tag_clause);
                tag_params = params.iter().map(|p| json!(p)).collect();
            }
        }
        let count_clause = clause.replace("?3", "?1").replace("?4", "?2").replace("?5", "?3");
        let mut count_params = vec![json!(time_start), json!(time_end)];
        count_params.extend(tag_params.clone());
        let before = self.count_where(&count_clause, count_params).await?;

        let now = current_timestamp();
        let mut params = vec![
            json!(now),
            json!(iso_from_timestamp(now)),
            json!(time_start),
            json!(time_end),
        ];
        params.extend(tag_params);
        self.client
            .d1_query(
                &format!(
                    "UPDATE memories SET deleted_at = ?1, updated_at = ?1, updated_at_iso = ?2
                     WHERE {clause}"
                ),
                params,
            )
            .await?;
        Ok(before)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let memories = self
            .fetch_where(
                "get_by_hash",
                "content_hash = ?1 AND deleted_at IS NULL",
                vec![json!(content_hash)],
            )
            .await?;
        Ok(memories.into_iter().next())
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        self.fetch_where(
            "get_by_exact_content",
            "content = ?1 AND deleted_at IS NULL",
            vec![json!(content)],
        )
        .await
    }

    async fn get_all_memories(
        &self,
        limit: usize,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        let mut clause = "deleted_at IS NULL".to_string();
        let mut params: Vec<Value> = Vec::new();
        if let Some(memory_type) = memory_type {
            params.push(json!(memory_type));
            clause.push_str(&format!(" AND memory_type = ?{}", params.len()));
        }
        if let Some(tags) = tags {
            let (tag_clause, tag_params) = build_tag_clause(tags, TagMatch::Any, params.len() + 1);
            if !tag_clause.is_empty() {
                clause.push_str(&format!(" AND {tag_clause}"));
                params.extend(tag_params.iter().map(|p| json!(p)));
            }
        }
        params.push(json!(limit));
        clause.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", params.len()));
        params.push(json!(offset));
        clause.push_str(&format!(" OFFSET ?{}", params.len()));

        self.fetch_where("get_all_memories", &clause, params).await
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        let mut clause = "deleted_at IS NULL".to_string();
        let mut params: Vec<Value> = Vec::new();
        if let Some(memory_type) = memory_type {
            params.push(json!(memory_type));
            clause.push_str(&format!(" AND memory_type = ?{}", params.len()));
        }
        if let Some(tags) = tags {
            let (tag_clause, tag_params) = build_tag_clause(tags, TagMatch::Any, params.len() + 1);
            if !tag_clause.is_empty() {
                clause.push_str(&format!(" AND {tag_clause}"));
                params.extend(tag_params.iter().map(|p| json!(p)));
            }
        }
        self.count_where(&clause, params).await
    }

    async fn count_untagged_memories(&self) -> Result<usize> {
        self.count_where("deleted_at IS NULL AND TRIM(tags_csv) = ''", vec![])
            .await
    }

    async fn delete_untagged_memories(&self) -> Result<usize> {
        let before = self.count_untagged_memories().await?;
        let now = current_timestamp();
        self.client
            .d1_query(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1, updated_at_iso = ?2
                 WHERE deleted_at IS NULL AND TRIM(tags_csv) = ''",
                vec![json!(now), json!(iso_from_timestamp(now))],
            )
            .await?;
        Ok(before)
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemoryQueryResult>> {
        let query_vector = self.embedder.embed(query).await?;
        // Over-fetch: some matches may be tombstones filtered at the DB.
        let matches = self.client.vectorize_query(&query_vector, k * 2).await?;

        let mut results = Vec::with_capacity(k);
        for m in matches {
            if results.len() >= k {
                break;
            }
            if let Some(memory) = self.get_by_hash(&m.id).await? {
                let distance = 1.0 - m.score;
                results.push(MemoryQueryResult {
                    memory,
                    similarity_score: Some(score_from_distance(distance)),
                    distance: Some(distance),
                });
            }
        }
        Ok(results)
    }

    async fn recall(
        &self,
        query: Option<&str>,
        k: usize,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<MemoryQueryResult>> {
        match query {
            Some(text) if !text.trim().is_empty() => {
                let results = self.retrieve(text, k * 2).await?;
                Ok(results
                    .into_iter()
                    .filter(|r| {
                        time_start.is_none_or(|start| r.memory.created_at >= start)
                            && time_end.is_none_or(|end| r.memory.created_at <= end)
                    })
                    .take(k)
                    .collect())
            },
            _ => {
                let memories = self
                    .search_by_timeframe(
                        time_start.unwrap_or(0.0),
                        time_end.unwrap_or_else(current_timestamp),
                        None,
                    )
                    .await?;
                Ok(memories
                    .into_iter()
                    .take(k)
                    .map(|memory| MemoryQueryResult {
                        memory,
                        similarity_score: None,
                        distance: None,
                    })
                    .collect())
            },
        }
    }

    async fn search_by_tag(
        &self,
        tags: &[String],
        match_mode: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>> {
        let (tag_clause, tag_params) = build_tag_clause(tags, match_mode, 1);
        if tag_clause.is_empty() {
            return Ok(Vec::new());
        }
        let mut clause = format!("deleted_at IS NULL AND {tag_clause}");
        let mut params: Vec<Value> = tag_params.iter().map(|p| json!(p)).collect();
        if let Some(start) = time_start {
            params.push(json!(start));
            clause.push_str(&format!(" AND created_at >= ?{}", params.len()));
        }
        if let Some(end) = time_end {
            params.push(json!(end));
            clause.push_str(&format!(" AND created_at <= ?{}", params.len()));
        }
        clause.push_str(" ORDER BY created_at DESC");
        self.fetch_where("search_by_tag", &clause, params).await
    }

    async fn search_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<Vec<Memory>> {
        let mut clause =
            "deleted_at IS NULL AND created_at >= ?1 AND created_at <= ?2".to_string();
        let mut params = vec![json!(time_start), json!(time_end)];
        if let Some(tag) = tag {
            let (tag_clause, tag_params) =
                build_tag_clause(std::slice::from_ref(&tag.to_string()), TagMatch::Any, 3);
            if !tag_clause.is_empty() {
                clause.push_str(&format!(" AND {tag_clause}"));
                params.extend(tag_params.iter().map(|p| json!(p)));
            }
        }
        clause.push_str(" ORDER BY created_at DESC");
        self.fetch_where("search_by_timeframe", &clause, params).await
    }

    async fn get_memory_timestamps(&self) -> Result<Vec<(String, f64, f64)>> {
        let rows = self
            .client
            .d1_query(
                "SELECT content_hash, created_at, updated_at FROM memories
                 WHERE deleted_at IS NULL ORDER BY created_at DESC",
                vec![],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some((
                    row.get("content_hash")?.as_str()?.to_string(),
                    row.get("created_at")?.as_f64()?,
                    row.get("updated_at")?.as_f64()?,
                ))
            })
            .collect())
    }

    async fn get_memories_updated_since(&self, since: f64, limit: usize) -> Result<Vec<Memory>> {
        // Tombstones included: deletion propagation rides on this.
        self.fetch_where(
            "get_memories_updated_since",
            "updated_at > ?1 ORDER BY updated_at ASC LIMIT ?2",
            vec![json!(since), json!(limit)],
        )
        .await
    }

    async fn get_all_content_hashes(&self) -> Result<HashSet<String>> {
        let rows = self
            .client
            .d1_query(
                "SELECT content_hash FROM memories WHERE deleted_at IS NULL",
                vec![],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("content_hash")?.as_str().map(ToString::to_string))
            .collect())
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let week_ago = current_timestamp() - 7.0 * 86_400.0;
        let total = self.count_where("deleted_at IS NULL", vec![]).await?;
        let this_week = self
            .count_where(
                "deleted_at IS NULL AND created_at >= ?1",
                vec![json!(week_ago)],
            )
            .await?;
        let rows = self
            .client
            .d1_query(
                "SELECT tags_csv FROM memories WHERE deleted_at IS NULL",
                vec![],
            )
            .await?;
        let unique_tags: HashSet<String> = rows
            .iter()
            .filter_map(|row| row.get("tags_csv")?.as_str().map(ToString::to_string))
            .flat_map(|csv| csv_to_tags(&csv))
            .collect();

        Ok(StorageStats {
            backend: self.backend_name().to_string(),
            total_memories: total,
            memories_this_week: this_week,
            unique_tags: unique_tags.len(),
            database_size_bytes: None,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: self.embedder.dimensions(),
        })
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        let tombstones = self
            .count_where(
                "content_hash = ?1 AND deleted_at IS NOT NULL",
                vec![json!(content_hash)],
            )
            .await?;
        Ok(tombstones > 0)
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = current_timestamp() - f64::from(older_than_days) * 86_400.0;
        let rows = self
            .client
            .d1_query(
                "SELECT content_hash, content FROM memories
                 WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
                vec![json!(cutoff)],
            )
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("content_hash")?.as_str().map(ToString::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let blob_keys: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("content")?.as_str())
            .filter_map(|content| blob_key(content).map(ToString::to_string))
            .collect();

        self.client
            .d1_query(
                "DELETE FROM memories WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
                vec![json!(cutoff)],
            )
            .await?;
        self.client.vectorize_delete(&ids).await?;
        self.capacity.release(ids.len() as u64);

        // Orphaned blobs go with their rows; a failed delete only leaks
        // storage, so it does not fail the purge.
        for key in &blob_keys {
            if let Err(e) = self.client.r2_delete(key).await {
                tracing::debug!(key = %key, error = %e, "blob cleanup skipped");
            }
        }

        tracing::info!(purged = ids.len(), older_than_days, "purged remote tombstones");
        Ok(ids.len())
    }
}
