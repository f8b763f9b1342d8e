//! Local `SQLite` vector store.
//!
//! A single-file, transactional store co-locating memory rows, embedding
//! vectors, and the association graph. Similarity search is cosine k-NN
//! over the `memory_embeddings` blobs; the user-visible score is
//! `1 - d/2` for cosine distance `d ∈ [0, 2]`, so 1.0 means identical.
//! An earlier L2-based scoring produced 0% scores on close text and is
//! guarded against by the retrieval tests.

mod connection;
mod graph;
mod migrations;
mod row;
mod sql;

pub use connection::{BUSY_TIMEOUT_MS, acquire_lock, configure_connection};
pub use migrations::{MIGRATIONS, Migration, run_migrations};
pub use sql::{build_tag_clause, csv_to_tags, escape_like_wildcards, tags_to_csv};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::config::Config;
use crate::embedding::{Embedder, cosine_distance, score_from_distance};
use crate::models::{
    Association, Direction, GraphPath, Memory, MemoryQueryResult, MetadataPatch, Subgraph,
    TagMatch, iso_from_timestamp,
};
use crate::storage::{MemoryStorage, StorageStats};
use crate::{Error, Result, current_timestamp};

use row::{memory_from_row, vector_to_blob};

const SELECT_MEMORY: &str = "SELECT m.content_hash, m.content, m.tags_csv, m.memory_type, \
     m.metadata_json, m.created_at, m.created_at_iso, m.updated_at, m.updated_at_iso, \
     m.deleted_at, e.vector \
     FROM memories m LEFT JOIN memory_embeddings e ON m.content_hash = e.content_hash";

/// The local vector store backend.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl SqliteStorage {
    /// Opens (or creates) the database file and configures the connection.
    ///
    /// Migrations run in [`MemoryStorage::initialize`], not here, so
    /// construction stays cheap for cache-hit paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file or its parent directory
    /// cannot be created or opened.
    pub fn new(path: &Path, embedder: Arc<dyn Embedder>, config: &Config) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage("create_data_dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| Error::storage("open_database", e))?;
        configure_connection(&conn, &config.sqlite_pragmas)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            embedder,
        })
    }

    /// Runs `f` under the connection lock, mapping errors to storage kind.
    fn with_conn<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut guard = acquire_lock(&self.conn);
        f(&mut guard).map_err(|e| Error::storage(operation, e))
    }

    /// Ensures the memory carries an embedding, computing one if needed.
    async fn ensure_embedding(&self, memory: &Memory) -> Result<Vec<f32>> {
        if let Some(embedding) = &memory.embedding {
            if embedding.len() != self.embedder.dimensions() {
                return Err(Error::Embedding(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.embedder.dimensions(),
                    embedding.len()
                )));
            }
            return Ok(embedding.clone());
        }
        self.embedder.embed(&memory.content).await
    }

    /// Brute-force cosine k-NN over non-deleted embeddings, optionally
    /// restricted to a creation-time window.
    fn nearest_hashes(
        &self,
        query_vector: &[f32],
        k: usize,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<(String, f32)>> {
        self.with_conn("knn_scan", |conn| {
            let mut sql = "SELECT e.content_hash, e.vector FROM memory_embeddings e \
                 JOIN memories m ON m.content_hash = e.content_hash \
                 WHERE m.deleted_at IS NULL"
                .to_string();
            let mut sql_params: Vec<SqlValue> = Vec::new();
            if let Some(start) = time_start {
                sql_params.push(SqlValue::Real(start));
                sql.push_str(&format!(" AND m.created_at >= ?{}", sql_params.len()));
            }
            if let Some(end) = time_end {
                sql_params.push(SqlValue::Real(end));
                sql.push_str(&format!(" AND m.created_at <= ?{}", sql_params.len()));
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut scored: Vec<(String, f32)> = stmt
                .query_map(params_from_iter(sql_params), |r| {
                    let hash: String = r.get(0)?;
                    let blob: Vec<u8> = r.get(1)?;
                    Ok((hash, row::blob_to_vector(&blob)))
                })?
                .filter_map(std::result::Result::ok)
                .map(|(hash, vector)| (hash, cosine_distance(query_vector, &vector)))
                .collect();

            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            Ok(scored)
        })
    }

    fn fetch_by_hash(conn: &Connection, content_hash: &str) -> rusqlite::Result<Option<Memory>> {
        conn.query_row(
            &format!("{SELECT_MEMORY} WHERE m.content_hash = ?1"),
            params![content_hash],
            memory_from_row,
        )
        .optional()
    }

    fn soft_delete_where(&self, operation: &str, clause: &str, mut sql_params: Vec<SqlValue>) -> Result<usize> {
        let now = current_timestamp();
        let iso = iso_from_timestamp(now);
        // ?1..?3 are the tombstone timestamps; caller clauses start at ?4
        let sql = format!(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?2, updated_at_iso = ?3 \
             WHERE deleted_at IS NULL AND {clause}"
        );
        let mut all_params = vec![
            SqlValue::Real(now),
            SqlValue::Real(now),
            SqlValue::Text(iso),
        ];
        all_params.append(&mut sql_params);
        self.with_conn(operation, |conn| {
            conn.execute(&sql, params_from_iter(all_params))
        })
    }
}

#[async_trait]
impl MemoryStorage for SqliteStorage {
    async fn initialize(&self) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        run_migrations(&guard)?;
        drop(guard);
        tracing::info!(path = %self.path.display(), "sqlite storage initialized");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite_vec"
    }

    async fn store(&self, memory: &Memory) -> Result<()> {
        let embedding = self.ensure_embedding(memory).await?;
        let metadata_json = Value::Object(memory.metadata.clone()).to_string();
        let tags_csv = tags_to_csv(&memory.tags);
        let hash = memory.content_hash.clone();

        let existing: Option<Option<f64>> = self.with_conn("store_check", |conn| {
            conn.query_row(
                "SELECT deleted_at FROM memories WHERE content_hash = ?1",
                params![hash],
                |r| r.get(0),
            )
            .optional()
        })?;
        if let Some(deleted_at) = existing {
            if deleted_at.is_none() {
                metrics::counter!("store_duplicate_total").increment(1);
                return Err(Error::Duplicate {
                    content_hash: memory.content_hash.clone(),
                });
            }
            // Re-storing over a tombstone resurrects with fresh timestamps.
        }

        self.with_conn("store", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO memories
                 (content_hash, content, tags_csv, memory_type, metadata_json,
                  created_at, created_at_iso, updated_at, updated_at_iso, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
                params![
                    memory.content_hash,
                    memory.content,
                    tags_csv,
                    memory.memory_type,
                    metadata_json,
                    memory.created_at,
                    memory.created_at_iso,
                    memory.updated_at,
                    memory.updated_at_iso,
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO memory_embeddings (content_hash, vector) VALUES (?1, ?2)",
                params![memory.content_hash, vector_to_blob(&embedding)],
            )?;
            tx.commit()
        })?;
        metrics::counter!("store_total").increment(1);
        Ok(())
    }

    async fn update_memory(&self, memory: &Memory) -> Result<()> {
        let metadata_json = Value::Object(memory.metadata.clone()).to_string();
        let tags_csv = tags_to_csv(&memory.tags);
        let changed = self.with_conn("update_memory", |conn| {
            conn.execute(
                // created_at is deliberately absent from the SET list
                "UPDATE memories SET tags_csv = ?1, memory_type = ?2, metadata_json = ?3,
                 updated_at = ?4, updated_at_iso = ?5
                 WHERE content_hash = ?6",
                params![
                    tags_csv,
                    memory.memory_type,
                    metadata_json,
                    memory.updated_at,
                    memory.updated_at_iso,
                    memory.content_hash,
                ],
            )
        })?;
        if changed == 0 {
            return Err(Error::storage(
                "update_memory",
                format!("memory not found: {}", memory.content_hash),
            ));
        }
        Ok(())
    }

    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        self.with_conn("update_memories_batch", |conn| {
            let tx = conn.transaction()?;
            let mut outcomes = Vec::with_capacity(memories.len());
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE memories SET tags_csv = ?1, memory_type = ?2, metadata_json = ?3,
                     updated_at = ?4, updated_at_iso = ?5
                     WHERE content_hash = ?6",
                )?;
                for memory in memories {
                    let changed = stmt.execute(params![
                        tags_to_csv(&memory.tags),
                        memory.memory_type,
                        Value::Object(memory.metadata.clone()).to_string(),
                        memory.updated_at,
                        memory.updated_at_iso,
                        memory.content_hash,
                    ])?;
                    outcomes.push(changed > 0);
                }
            }
            tx.commit()?;
            Ok(outcomes)
        })
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
            // Even with caller-supplied timestamps, created_at is immutable.
            memory.updated_at = patch.updated_at.unwrap_or_else(current_timestamp);
            memory.updated_at_iso = iso_from_timestamp(memory.updated_at);
        }

        self.update_memory(&memory).await?;
        Ok(memory)
    }

    async fn delete(&self, content_hash: &str) -> Result<bool> {
        let changed = self.soft_delete_where(
            "delete",
            "content_hash = ?4",
            vec![SqlValue::Text(content_hash.to_string())],
        )?;
        if changed > 0 {
            metrics::counter!("delete_total").increment(1);
        }
        Ok(changed > 0)
    }

    async fn delete_by_tags(&self, tags: &[String], match_mode: TagMatch) -> Result<usize> {
        let (clause, tag_params) = build_tag_clause(tags, match_mode, 4);
        if clause.is_empty() {
            return Ok(0);
        }
        self.soft_delete_where(
            "delete_by_tags",
            &clause,
            tag_params.into_iter().map(SqlValue::Text).collect(),
        )
    }

    async fn delete_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<usize> {
        let mut clause = "created_at >= ?4 AND created_at <= ?5".to_string();
        let mut sql_params = vec![SqlValue::Real(time_start), SqlValue::Real(time_end)];
        if let Some(tag) = tag {
            let (tag_clause, tag_params) =
                build_tag_clause(std::slice::from_ref(&tag.to_string()), TagMatch::Any, 6);
            if !tag_clause.is_empty() {
                clause.push_str(" AND ");
                clause.push_str(&tag_clause);
                sql_params.extend(tag_params.into_iter().map(SqlValue::Text));
            }
        }
        self.soft_delete_where("delete_by_timeframe", &clause, sql_params)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let memory = self.with_conn("get_by_hash", |conn| {
            Self::fetch_by_hash(conn, content_hash)
        })?;
        Ok(memory.filter(|m| !m.is_deleted()))
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        self.with_conn("get_by_exact_content", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MEMORY} WHERE m.deleted_at IS NULL AND m.content = ?1"
            ))?;
            stmt.query_map(params![content], memory_from_row)?.collect()
        })
    }

    async fn get_all_memories(
        &self,
        limit: usize,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        self.with_conn("get_all_memories", |conn| {
            let mut sql = format!("{SELECT_MEMORY} WHERE m.deleted_at IS NULL");
            let mut sql_params: Vec<SqlValue> = Vec::new();
            if let Some(memory_type) = memory_type {
                sql_params.push(SqlValue::Text(memory_type.to_string()));
                sql.push_str(&format!(" AND m.memory_type = ?{}", sql_params.len()));
            }
            if let Some(tags) = tags {
                let (clause, tag_params) =
                    build_tag_clause(tags, TagMatch::Any, sql_params.len() + 1);
                if !clause.is_empty() {
                    // build_tag_clause targets the bare column name
                    sql.push_str(&format!(" AND {}", clause.replace("tags_csv", "m.tags_csv")));
                    sql_params.extend(tag_params.into_iter().map(SqlValue::Text));
                }
            }
            sql_params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(
                " ORDER BY m.created_at DESC LIMIT ?{}",
                sql_params.len()
            ));
            sql_params.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(0)));
            sql.push_str(&format!(" OFFSET ?{}", sql_params.len()));

            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(sql_params), memory_from_row)?
                .collect()
        })
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        self.with_conn("count_all_memories", |conn| {
            let mut sql = "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL".to_string();
            let mut sql_params: Vec<SqlValue> = Vec::new();
            if let Some(memory_type) = memory_type {
                sql_params.push(SqlValue::Text(memory_type.to_string()));
                sql.push_str(&format!(" AND memory_type = ?{}", sql_params.len()));
            }
            if let Some(tags) = tags {
                let (clause, tag_params) =
                    build_tag_clause(tags, TagMatch::Any, sql_params.len() + 1);
                if !clause.is_empty() {
                    sql.push_str(&format!(" AND {clause}"));
                    sql_params.extend(tag_params.into_iter().map(SqlValue::Text));
                }
            }
            let count: i64 =
                conn.query_row(&sql, params_from_iter(sql_params), |r| r.get(0))?;
            #[allow(clippy::cast_sign_loss)]
            let count = count as usize;
            Ok(count)
        })
    }

    async fn count_untagged_memories(&self) -> Result<usize> {
        self.with_conn("count_untagged_memories", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND TRIM(tags_csv) = ''",
                [],
                |r| r.get(0),
            )?;
            #[allow(clippy::cast_sign_loss)]
            let count = count as usize;
            Ok(count)
        })
    }

    async fn delete_untagged_memories(&self) -> Result<usize> {
        self.soft_delete_where("delete_untagged_memories", "TRIM(tags_csv) = ''", vec![])
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemoryQueryResult>> {
        let query_vector = self.embedder.embed(query).await?;
        let neighbors = self.nearest_hashes(&query_vector, k, None, None)?;
        self.with_conn("retrieve_fetch", |conn| {
            let mut results = Vec::with_capacity(neighbors.len());
            for (hash, distance) in &neighbors {
                if let Some(memory) = Self::fetch_by_hash(conn, hash)? {
                    results.push(MemoryQueryResult {
                        memory,
                        similarity_score: Some(score_from_distance(*distance)),
                        distance: Some(*distance),
                    });
                }
            }
            Ok(results)
        })
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
                let query_vector = self.embedder.embed(text).await?;
                let neighbors = self.nearest_hashes(&query_vector, k, time_start, time_end)?;
                self.with_conn("recall_fetch", |conn| {
                    let mut results = Vec::with_capacity(neighbors.len());
                    for (hash, distance) in &neighbors {
                        if let Some(memory) = Self::fetch_by_hash(conn, hash)? {
                            results.push(MemoryQueryResult {
                                memory,
                                similarity_score: Some(score_from_distance(*distance)),
                                distance: Some(*distance),
                            });
                        }
                    }
                    Ok(results)
                })
            },
            _ => {
                // No query: degrade to most-recent within the window.
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
        self.with_conn("search_by_tag", |conn| {
            let mut sql = format!("{SELECT_MEMORY} WHERE m.deleted_at IS NULL");
            let mut sql_params: Vec<SqlValue> = Vec::new();

            let (clause, tag_params) = build_tag_clause(tags, match_mode, 1);
            if clause.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND {}", clause.replace("tags_csv", "m.tags_csv")));
            sql_params.extend(tag_params.into_iter().map(SqlValue::Text));

            if let Some(start) = time_start {
                sql_params.push(SqlValue::Real(start));
                sql.push_str(&format!(" AND m.created_at >= ?{}", sql_params.len()));
            }
            if let Some(end) = time_end {
                sql_params.push(SqlValue::Real(end));
                sql.push_str(&format!(" AND m.created_at <= ?{}", sql_params.len()));
            }
            sql.push_str(" ORDER BY m.created_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(sql_params), memory_from_row)?
                .collect()
        })
    }

    async fn search_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<Vec<Memory>> {
        self.with_conn("search_by_timeframe", |conn| {
            let mut sql = format!(
                "{SELECT_MEMORY} WHERE m.deleted_at IS NULL \
                 AND m.created_at >= ?1 AND m.created_at <= ?2"
            );
            let mut sql_params = vec![SqlValue::Real(time_start), SqlValue::Real(time_end)];
            if let Some(tag) = tag {
                let (clause, tag_params) =
                    build_tag_clause(std::slice::from_ref(&tag.to_string()), TagMatch::Any, 3);
                if !clause.is_empty() {
                    sql.push_str(&format!(" AND {}", clause.replace("tags_csv", "m.tags_csv")));
                    sql_params.extend(tag_params.into_iter().map(SqlValue::Text));
                }
            }
            sql.push_str(" ORDER BY m.created_at DESC");
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(sql_params), memory_from_row)?
                .collect()
        })
    }

    async fn get_memory_timestamps(&self) -> Result<Vec<(String, f64, f64)>> {
        self.with_conn("get_memory_timestamps", |conn| {
            let mut stmt = conn.prepare(
                "SELECT content_hash, created_at, updated_at FROM memories \
                 WHERE deleted_at IS NULL ORDER BY created_at DESC",
            )?;
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect()
        })
    }

    async fn get_memories_updated_since(&self, since: f64, limit: usize) -> Result<Vec<Memory>> {
        // Tombstones are included: drift detection needs to see deletions.
        self.with_conn("get_memories_updated_since", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MEMORY} WHERE m.updated_at > ?1 ORDER BY m.updated_at ASC LIMIT ?2"
            ))?;
            stmt.query_map(
                params![since, i64::try_from(limit).unwrap_or(i64::MAX)],
                memory_from_row,
            )?
            .collect()
        })
    }

    async fn get_all_content_hashes(&self) -> Result<HashSet<String>> {
        self.with_conn("get_all_content_hashes", |conn| {
            let mut stmt =
                conn.prepare("SELECT content_hash FROM memories WHERE deleted_at IS NULL")?;
            stmt.query_map([], |r| r.get(0))?.collect()
        })
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let week_ago = current_timestamp() - 7.0 * 86_400.0;
        let (total, this_week, tag_csvs) =
            self.with_conn("get_stats", |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
                    [],
                    |r| r.get(0),
                )?;
                let this_week: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND created_at >= ?1",
                    params![week_ago],
                    |r| r.get(0),
                )?;
                let mut stmt =
                    conn.prepare("SELECT tags_csv FROM memories WHERE deleted_at IS NULL")?;
                let tag_csvs: Vec<String> =
                    stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect();
                Ok((total, this_week, tag_csvs))
            })?;

        let unique_tags: HashSet<String> = tag_csvs
            .iter()
            .flat_map(|csv| csv_to_tags(csv))
            .collect();
        let database_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).ok();

        #[allow(clippy::cast_sign_loss)]
        let (total, this_week) = (total as usize, this_week as usize);
        Ok(StorageStats {
            backend: self.backend_name().to_string(),
            total_memories: total,
            memories_this_week: this_week,
            unique_tags: unique_tags.len(),
            database_size_bytes,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: self.embedder.dimensions(),
        })
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        self.with_conn("is_deleted", |conn| {
            let deleted: Option<Option<f64>> = conn
                .query_row(
                    "SELECT deleted_at FROM memories WHERE content_hash = ?1",
                    params![content_hash],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(matches!(deleted, Some(Some(_))))
        })
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = current_timestamp() - f64::from(older_than_days) * 86_400.0;
        let purged = self.with_conn("purge_deleted", |conn| {
            let tx = conn.transaction()?;
            let purged = tx.execute(
                "DELETE FROM memories WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
                params![cutoff],
            )?;
            // Orphaned edges go with their endpoints.
            tx.execute(
                "DELETE FROM memory_graph WHERE
                 source_hash NOT IN (SELECT content_hash FROM memories)
                 OR target_hash NOT IN (SELECT content_hash FROM memories)",
                [],
            )?;
            tx.commit()?;
            Ok(purged)
        })?;
        if purged > 0 {
            tracing::info!(purged, older_than_days, "purged tombstoned memories");
            metrics::counter!("purge_tombstoned_total").increment(purged as u64);
        }
        Ok(purged)
    }

    async fn store_association(&self, association: &Association) -> Result<()> {
        self.with_conn("store_association", |conn| {
            graph::store_association(conn, association)
        })
    }

    async fn find_connected(
        &self,
        content_hash: &str,
        max_hops: usize,
        direction: Direction,
    ) -> Result<Vec<(String, usize)>> {
        self.with_conn("find_connected", |conn| {
            graph::find_connected(conn, content_hash, max_hops, direction)
        })
    }

    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<GraphPath>> {
        self.with_conn("shortest_path", |conn| graph::shortest_path(conn, from, to))
    }

    async fn get_subgraph(&self, content_hash: &str, radius: usize) -> Result<Subgraph> {
        self.with_conn("get_subgraph", |conn| {
            graph::get_subgraph(conn, content_hash, radius)
        })
    }

    async fn get_associations(&self, content_hash: &str) -> Result<Vec<Association>> {
        self.with_conn("get_associations", |conn| {
            graph::get_associations(conn, content_hash)
        })
    }

    async fn close(&self) -> Result<()> {
        // WAL checkpoint keeps the sidecar files small across restarts.
        let _ = self.with_conn("close", |conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;
    use crate::models::RelationshipType;
    use serde_json::Map;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn test_storage(dir: &TempDir) -> SqliteStorage {
        let config = Config::default();
        SqliteStorage::new(
            &dir.path().join("test.db"),
            Arc::new(HashedEmbedder::new()),
            &config,
        )
        .unwrap()
    }

    fn make_memory(content: &str, tags: &[&str]) -> Memory {
        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        Memory::new(
            content,
            hash,
            tags.iter().map(ToString::to_string).collect(),
            Some("note".to_string()),
            Map::new(),
        )
    }

    #[tokio::test]
    async fn test_store_and_get_by_hash() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("remember the WAL checkpoint", &["sqlite"]);
        storage.store(&memory).await.unwrap();

        let fetched = storage.get_by_hash(&memory.content_hash).await.unwrap();
        let fetched = fetched.unwrap();
        assert_eq!(fetched.content, memory.content);
        assert_eq!(fetched.tags, vec!["sqlite"]);
        assert!(fetched.embedding.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_store_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("only once", &[]);
        storage.store(&memory).await.unwrap();
        let err = storage.store(&memory).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate { content_hash } if content_hash == memory.content_hash));
        assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("to be deleted", &["temp"]);
        storage.store(&memory).await.unwrap();

        assert!(storage.delete(&memory.content_hash).await.unwrap());
        assert!(!storage.delete(&memory.content_hash).await.unwrap());

        assert!(storage.get_by_hash(&memory.content_hash).await.unwrap().is_none());
        assert!(storage.is_deleted(&memory.content_hash).await.unwrap());
        assert!(
            storage
                .search_by_tag(&["temp".to_string()], TagMatch::Any, None, None)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tag_exact_match_discipline() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage.store(&make_memory("one", &["test"])).await.unwrap();
        storage.store(&make_memory("two", &["testing"])).await.unwrap();
        storage
            .store(&make_memory("three", &["tests", "regression"]))
            .await
            .unwrap();

        let hits = storage
            .search_by_tag(&["test".to_string()], TagMatch::Any, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "one");
    }

    #[tokio::test]
    async fn test_tag_and_combination() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage.store(&make_memory("a", &["x", "y"])).await.unwrap();
        storage.store(&make_memory("b", &["x"])).await.unwrap();

        let both = storage
            .search_by_tag(
                &["x".to_string(), "y".to_string()],
                TagMatch::All,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].content, "a");

        let either = storage
            .search_by_tag(
                &["x".to_string(), "y".to_string()],
                TagMatch::Any,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(either.len(), 2);
    }

    #[tokio::test]
    async fn test_retrieve_scores_and_order() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage
            .store(&make_memory(
                "the mitochondria is the powerhouse of the cell",
                &["biology"],
            ))
            .await
            .unwrap();
        storage
            .store(&make_memory("sqlite uses b-trees for indices", &["db"]))
            .await
            .unwrap();

        let results = storage
            .retrieve("the mitochondria is the powerhouse of the cell", 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let top = &results[0];
        assert!(top.memory.content.contains("mitochondria"));
        // Exact-content query must clear the 0.7 bar; L2-style scoring that
        // collapses to 0% is a regression.
        assert!(top.similarity_score.unwrap() >= 0.7);
        let scores: Vec<f32> = results.iter().map(|r| r.similarity_score.unwrap()).collect();
        assert!(scores[0] >= scores[1]);
        for score in scores {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[tokio::test]
    async fn test_recall_without_query_returns_recent() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut old = make_memory("old entry", &[]);
        old.created_at = current_timestamp() - 10_000.0;
        old.updated_at = old.created_at;
        old.normalize_timestamps();
        storage.store(&old).await.unwrap();
        storage.store(&make_memory("new entry", &[])).await.unwrap();

        let results = storage
            .recall(None, 5, Some(current_timestamp() - 100.0), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, "new entry");
        assert!(results[0].similarity_score.is_none());
    }

    #[tokio::test]
    async fn test_update_preserves_created_at() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("original", &["keep"]);
        storage.store(&memory).await.unwrap();

        let patch = MetadataPatch {
            tags: Some(vec!["keep".to_string(), "extra".to_string()]),
            ..Default::default()
        };
        let updated = storage
            .update_memory_metadata(&memory.content_hash, &patch, true)
            .await
            .unwrap();

        assert!((updated.created_at - memory.created_at).abs() < 1e-6);
        assert!(updated.updated_at >= memory.updated_at);
        assert_eq!(updated.tags, vec!["keep", "extra"]);

        // preserve_timestamps = false must still not reset created_at
        let patch = MetadataPatch {
            updated_at: Some(memory.created_at + 5.0),
            ..Default::default()
        };
        let updated = storage
            .update_memory_metadata(&memory.content_hash, &patch, false)
            .await
            .unwrap();
        assert!((updated.created_at - memory.created_at).abs() < 1e-6);
        assert!((updated.updated_at - (memory.created_at + 5.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_batch_update_matches_sequential() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut memories = Vec::new();
        for i in 0..20 {
            let memory = make_memory(&format!("memory number {i}"), &[]);
            storage.store(&memory).await.unwrap();
            memories.push(memory);
        }

        for memory in &mut memories {
            memory.metadata.insert(
                "relevance_score".to_string(),
                serde_json::json!(0.42),
            );
            memory.touch();
        }

        let outcomes = storage.update_memories_batch(&memories).await.unwrap();
        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(|&updated| updated));

        let fetched = storage
            .get_by_hash(&memories[7].content_hash)
            .await
            .unwrap()
            .unwrap();
        assert!((fetched.metadata_f64("relevance_score").unwrap() - 0.42).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_updated_since_includes_tombstones() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("soon deleted", &[]);
        storage.store(&memory).await.unwrap();
        let mark = current_timestamp();
        storage.delete(&memory.content_hash).await.unwrap();

        let changed = storage.get_memories_updated_since(mark, 100).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].is_deleted());
    }

    #[tokio::test]
    async fn test_purge_deleted_respects_retention() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let memory = make_memory("ancient tombstone", &[]);
        storage.store(&memory).await.unwrap();
        storage.delete(&memory.content_hash).await.unwrap();

        // Recent tombstone survives a 30-day purge
        assert_eq!(storage.purge_deleted(30).await.unwrap(), 0);
        // Zero-day retention removes it
        assert_eq!(storage.purge_deleted(0).await.unwrap(), 1);
        assert!(!storage.is_deleted(&memory.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_untagged_count_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage.store(&make_memory("tagged", &["t"])).await.unwrap();
        storage.store(&make_memory("untagged one", &[])).await.unwrap();
        storage.store(&make_memory("untagged two", &[])).await.unwrap();

        assert_eq!(storage.count_untagged_memories().await.unwrap(), 2);
        assert_eq!(storage.delete_untagged_memories().await.unwrap(), 2);
        assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_graph_round_trip_and_traversal() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let a = make_memory("node a", &[]);
        let b = make_memory("node b", &[]);
        let c = make_memory("node c", &[]);
        for memory in [&a, &b, &c] {
            storage.store(memory).await.unwrap();
        }

        storage
            .store_association(&Association::new(
                &a.content_hash,
                &b.content_hash,
                RelationshipType::Causes,
                0.6,
            ))
            .await
            .unwrap();
        storage
            .store_association(&Association::new(
                &b.content_hash,
                &c.content_hash,
                RelationshipType::Related,
                0.5,
            ))
            .await
            .unwrap();

        let outgoing = storage
            .find_connected(&a.content_hash, 2, Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(outgoing.len(), 2);

        // Asymmetric edge does not traverse backwards
        let incoming = storage
            .find_connected(&a.content_hash, 2, Direction::Incoming)
            .await
            .unwrap();
        assert!(incoming.is_empty());

        // Symmetric edge traverses both ways
        let from_c = storage
            .find_connected(&c.content_hash, 1, Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(from_c.len(), 1);
        assert_eq!(from_c[0].0, b.content_hash);

        let path = storage
            .shortest_path(&a.content_hash, &c.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.length, 2);
        assert_eq!(path.hashes.len(), 3);

        let subgraph = storage.get_subgraph(&b.content_hash, 1).await.unwrap();
        assert_eq!(subgraph.nodes.len(), 3);
        assert!(!subgraph.edges.is_empty());
    }

    #[tokio::test]
    async fn test_get_all_memories_ordering_and_filters() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        let mut first = make_memory("first", &["a"]);
        first.created_at -= 100.0;
        first.normalize_timestamps();
        storage.store(&first).await.unwrap();
        let mut second = make_memory("second", &["b"]);
        second.memory_type = Some("decision".to_string());
        storage.store(&second).await.unwrap();

        let all = storage.get_all_memories(10, 0, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "second");
        assert!(all[0].embedding.is_some());

        let decisions = storage
            .get_all_memories(10, 0, Some("decision"), None)
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(storage.count_all_memories(Some("decision"), None).await.unwrap(), 1);

        let tagged_a = storage
            .get_all_memories(10, 0, None, Some(&["a".to_string()]))
            .await
            .unwrap();
        assert_eq!(tagged_a.len(), 1);
        assert_eq!(tagged_a[0].content, "first");
    }

    #[tokio::test]
    async fn test_exact_content_lookup() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage.store(&make_memory("verbatim text", &[])).await.unwrap();
        let hits = storage.get_by_exact_content("verbatim text").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(storage.get_by_exact_content("verbatim").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();

        storage.store(&make_memory("x", &["alpha", "beta"])).await.unwrap();
        storage.store(&make_memory("y", &["alpha"])).await.unwrap();

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.backend, "sqlite_vec");
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.memories_this_week, 2);
        assert_eq!(stats.unique_tags, 2);
        assert_eq!(stats.embedding_dimension, 384);
        assert!(stats.database_size_bytes.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_second_initialize_skips_ddl() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);
        storage.initialize().await.unwrap();
        storage.store(&make_memory("survives re-init", &[])).await.unwrap();

        let again = test_storage(&dir);
        again.initialize().await.unwrap();
        assert_eq!(again.count_all_memories(None, None).await.unwrap(), 1);
    }
}
