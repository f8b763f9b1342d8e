//! Consolidation engine.
//!
//! Periodically walks stored memories and performs the maintenance a
//! long-lived memory store needs: relevance decay, creative association
//! discovery, semantic clustering with statistical compression, and
//! controlled forgetting. Runs in-process against any storage backend,
//! yields between batches, and never blocks user operations.

mod associations;
mod clustering;
mod compression;
mod decay;
mod forgetting;

pub use associations::{
    CREATIVE_BAND, association_memory_content, discover_associations, infer_relationship,
};
pub use clustering::{DbscanParams, clusters_from_labels, dbscan};
pub use compression::{CLUSTER_TAG, compress_cluster};
pub use decay::{DecayProfile, apply_connection_boost, compute_relevance};
pub use forgetting::{DORMANCY_DAYS, RELEVANCE_FLOOR, archive, is_archivable};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use serde_json::json;
use tracing::instrument;

use crate::config::{ConsolidationConfig, GraphStorageMode};
use crate::models::Memory;
use crate::services::content_hash;
use crate::storage::MemoryStorage;
use crate::{Error, Result, current_timestamp};

/// Memories examined per engine pass.
const SCAN_LIMIT: usize = 10_000;

/// Batch size for relevance writes; the engine yields between batches.
const UPDATE_BATCH: usize = 500;

/// Consolidation horizon: which phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    /// Relevance decay only.
    Daily,
    /// Decay plus associations and clustering.
    Weekly,
    /// Everything, including controlled forgetting.
    Monthly,
}

impl Horizon {
    /// Stable name for status payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Parses a horizon name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    const fn runs_associations(self) -> bool {
        !matches!(self, Self::Daily)
    }

    const fn runs_forgetting(self) -> bool {
        matches!(self, Self::Monthly)
    }
}

/// Outcome of one engine pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    /// Horizon that ran.
    pub horizon: String,
    /// Memories examined.
    pub scanned: usize,
    /// Relevance scores written.
    pub relevance_updated: usize,
    /// Quality boosts applied.
    pub boosts_applied: usize,
    /// Association edges persisted.
    pub associations_created: usize,
    /// Clusters found by DBSCAN.
    pub clusters_found: usize,
    /// Compressed cluster memories created.
    pub compressed_created: usize,
    /// Memories archived by forgetting.
    pub archived: usize,
    /// Whether a pause interrupted the pass.
    pub interrupted: bool,
    /// Wall-clock duration, milliseconds.
    pub elapsed_ms: u64,
}

/// Engine status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationStatus {
    /// Master switch from configuration.
    pub enabled: bool,
    /// A pass is executing right now.
    pub running: bool,
    /// Paused between batches.
    pub paused: bool,
    /// Completion timestamps per horizon.
    pub last_runs: HashMap<String, f64>,
    /// Total passes completed since startup.
    pub total_runs: u64,
}

/// The consolidation engine.
pub struct ConsolidationEngine {
    storage: Arc<dyn MemoryStorage>,
    config: ConsolidationConfig,
    graph_mode: GraphStorageMode,
    profile: DecayProfile,
    dbscan_params: DbscanParams,
    paused: AtomicBool,
    running: AtomicBool,
    total_runs: AtomicU64,
    last_runs: Mutex<HashMap<&'static str, f64>>,
}

impl ConsolidationEngine {
    /// Builds an engine over a storage backend.
    #[must_use]
    pub fn new(
        storage: Arc<dyn MemoryStorage>,
        config: ConsolidationConfig,
        graph_mode: GraphStorageMode,
    ) -> Self {
        Self {
            storage,
            config,
            graph_mode,
            profile: DecayProfile::default(),
            dbscan_params: DbscanParams::default(),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            total_runs: AtomicU64::new(0),
            last_runs: Mutex::new(HashMap::new()),
        }
    }

    /// Pauses the engine between batches.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!("consolidation paused");
    }

    /// Resumes a paused engine.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        tracing::info!("consolidation resumed");
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ConsolidationStatus {
        let last_runs = self
            .last_runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(horizon, at)| ((*horizon).to_string(), *at))
            .collect();
        ConsolidationStatus {
            enabled: self.config.enabled,
            running: self.running.load(Ordering::Acquire),
            paused: self.paused.load(Ordering::Acquire),
            last_runs,
            total_runs: self.total_runs.load(Ordering::Relaxed),
        }
    }

    /// Operator guidance derived from the current corpus.
    ///
    /// # Errors
    ///
    /// Returns an error when storage stats cannot be read.
    pub async fn recommendations(&self) -> Result<Vec<String>> {
        let stats = self.storage.get_stats().await?;
        let untagged = self.storage.count_untagged_memories().await?;

        let mut recommendations = Vec::new();
        if untagged > 0 {
            recommendations.push(format!(
                "{untagged} memories carry no tags; tagging improves association discovery"
            ));
        }
        if stats.total_memories > 5_000 && !self.config.schedule_weekly {
            recommendations.push(
                "corpus exceeds 5k memories; enable the weekly horizon for clustering".to_string(),
            );
        }
        if stats.memories_this_week == 0 {
            recommendations
                .push("no new memories this week; consolidation can run monthly".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("no action needed".to_string());
        }
        Ok(recommendations)
    }

    fn check_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Runs one consolidation pass for `horizon`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when disabled or already running,
    /// or a storage error from the underlying backend.
    #[instrument(skip(self), fields(horizon = horizon.as_str()))]
    #[allow(clippy::too_many_lines)]
    pub async fn run(&self, horizon: Horizon) -> Result<ConsolidationReport> {
        if !self.config.enabled {
            return Err(Error::Validation("consolidation is disabled".to_string()));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Validation(
                "a consolidation pass is already running".to_string(),
            ));
        }

        let result = self.run_inner(horizon).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_inner(&self, horizon: Horizon) -> Result<ConsolidationReport> {
        let started = std::time::Instant::now();
        let now = current_timestamp();
        let mut report = ConsolidationReport {
            horizon: horizon.as_str().to_string(),
            ..Default::default()
        };

        // The scan must carry embeddings: associations and clustering
        // operate on vectors, and a zero-embedding pass is a silent no-op.
        let memories = self
            .storage
            .get_all_memories(SCAN_LIMIT, 0, None, None)
            .await?;
        report.scanned = memories.len();

        // Phase 1: relevance decay, written in batched transactions.
        let mut scored = Vec::with_capacity(memories.len());
        for mut memory in memories.iter().cloned() {
            let relevance = compute_relevance(&memory, now, &self.profile);
            memory
                .metadata
                .insert("relevance_score".to_string(), json!(relevance));
            memory
                .metadata
                .insert("relevance_calculated_at".to_string(), json!(now));

            if self.config.quality_boost_enabled
                && memory.metadata_f64("quality_score").is_some()
            {
                let connections = self
                    .storage
                    .get_associations(&memory.content_hash)
                    .await
                    .map(|edges| edges.len())
                    .unwrap_or(0);
                if apply_connection_boost(
                    &mut memory,
                    connections,
                    self.config.min_connections_for_boost,
                    self.config.quality_boost_factor,
                    now,
                ) {
                    report.boosts_applied += 1;
                }
            }

            memory.touch();
            scored.push(memory);
        }
        for batch in scored.chunks(UPDATE_BATCH) {
            if self.check_paused() {
                report.interrupted = true;
                break;
            }
            let outcomes = self.storage.update_memories_batch(batch).await?;
            report.relevance_updated += outcomes.iter().filter(|&&updated| updated).count();
            tokio::task::yield_now().await;
        }

        // Phase 2: creative associations.
        if horizon.runs_associations() && !report.interrupted {
            let found = discover_associations(&scored);
            for association in &found {
                if self.check_paused() {
                    report.interrupted = true;
                    break;
                }
                if matches!(
                    self.graph_mode,
                    GraphStorageMode::GraphOnly | GraphStorageMode::DualWrite
                ) {
                    self.storage.store_association(association).await?;
                }
                if matches!(
                    self.graph_mode,
                    GraphStorageMode::MemoriesOnly | GraphStorageMode::DualWrite
                ) {
                    let content = association_memory_content(association);
                    let tags = vec!["association".to_string()];
                    let hash = content_hash(&content, &tags, Some("association"));
                    let mut memory = Memory::new(
                        content,
                        hash,
                        tags,
                        Some("association".to_string()),
                        serde_json::Map::new(),
                    );
                    memory.metadata.insert(
                        "source_memory_hashes".to_string(),
                        json!([association.source_hash, association.target_hash]),
                    );
                    match self.storage.store(&memory).await {
                        Ok(()) | Err(Error::Duplicate { .. }) => {},
                        Err(e) => return Err(e),
                    }
                }
                report.associations_created += 1;
            }
        }

        // Phase 3: clustering and compression.
        if horizon.runs_associations() && !report.interrupted {
            let embedded: Vec<&Memory> = scored
                .iter()
                .filter(|m| m.embedding.is_some() && !m.tags.contains(&CLUSTER_TAG.to_string()))
                .collect();
            let vectors: Vec<Vec<f32>> = embedded
                .iter()
                .filter_map(|m| m.embedding.clone())
                .collect();
            let labels = dbscan(&vectors, &self.dbscan_params);
            let clusters = clusters_from_labels(&labels);
            report.clusters_found = clusters.len();

            for cluster in clusters {
                if self.check_paused() {
                    report.interrupted = true;
                    break;
                }
                let members: Vec<&Memory> = cluster.iter().map(|&i| embedded[i]).collect();
                if let Some(compressed) = compress_cluster(&members) {
                    match self.storage.store(&compressed).await {
                        Ok(()) => report.compressed_created += 1,
                        Err(Error::Duplicate { .. }) => {},
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        // Phase 4: controlled forgetting.
        if horizon.runs_forgetting() && !report.interrupted {
            let mut archived = Vec::new();
            for memory in &scored {
                let relevance = memory.metadata_f64("relevance_score").unwrap_or(1.0);
                if is_archivable(memory, relevance, now) {
                    let mut tombstone_candidate = memory.clone();
                    archive(&mut tombstone_candidate, relevance, now);
                    archived.push(tombstone_candidate);
                }
            }
            for batch in archived.chunks(UPDATE_BATCH) {
                if self.check_paused() {
                    report.interrupted = true;
                    break;
                }
                let outcomes = self.storage.update_memories_batch(batch).await?;
                report.archived += outcomes.iter().filter(|&&updated| updated).count();
                tokio::task::yield_now().await;
            }
        }

        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.total_runs.fetch_add(1, Ordering::Relaxed);
        {
            let mut last_runs = self
                .last_runs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last_runs.insert(horizon.as_str(), now);
        }

        tracing::info!(
            horizon = horizon.as_str(),
            scanned = report.scanned,
            relevance_updated = report.relevance_updated,
            associations = report.associations_created,
            clusters = report.clusters_found,
            archived = report.archived,
            interrupted = report.interrupted,
            elapsed_ms = report.elapsed_ms,
            "consolidation pass finished"
        );
        metrics::counter!("consolidation_runs_total").increment(1);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashedEmbedder;
    use crate::storage::sqlite::SqliteStorage;
    use serde_json::Map;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    async fn engine_with_storage(dir: &TempDir) -> (ConsolidationEngine, Arc<dyn MemoryStorage>) {
        let storage: Arc<dyn MemoryStorage> = Arc::new(
            SqliteStorage::new(
                &dir.path().join("consolidate.db"),
                Arc::new(HashedEmbedder::new()),
                &Config::default(),
            )
            .unwrap(),
        );
        storage.initialize().await.unwrap();
        let engine = ConsolidationEngine::new(
            Arc::clone(&storage),
            ConsolidationConfig::default(),
            GraphStorageMode::GraphOnly,
        );
        (engine, storage)
    }

    fn aged(content: &str, age_days: f64) -> Memory {
        let mut memory = Memory::new(
            content,
            hex::encode(Sha256::digest(content.as_bytes())),
            vec![],
            None,
            Map::new(),
        );
        memory.created_at = current_timestamp() - age_days * 86_400.0;
        memory.updated_at = memory.created_at;
        memory.normalize_timestamps();
        memory
    }

    #[tokio::test]
    async fn test_relevance_pass_is_batched_and_preserves_created_at() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;

        let mut originals = Vec::new();
        for i in 0..500 {
            let memory = aged(&format!("memory with varied age {i}"), f64::from(i % 90));
            storage.store(&memory).await.unwrap();
            originals.push(memory);
        }

        let report = engine.run(Horizon::Weekly).await.unwrap();
        assert_eq!(report.scanned, 500);
        assert_eq!(report.relevance_updated, 500);
        // Well under the one-second budget on a local store; generous
        // margin for shared CI hardware.
        assert!(report.elapsed_ms < 5_000);

        for original in originals.iter().step_by(50) {
            let stored = storage
                .get_by_hash(&original.content_hash)
                .await
                .unwrap()
                .unwrap();
            let relevance = stored.metadata_f64("relevance_score").unwrap();
            assert!((0.0..=1.0).contains(&relevance));
            assert!((stored.created_at - original.created_at).abs() < 1e-6);
            assert!(stored.updated_at > original.updated_at);
        }
    }

    #[tokio::test]
    async fn test_relevance_never_exceeds_one_and_quality_capped() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;

        let mut memory = aged("heavily used high quality", 1.0);
        memory.metadata.insert("quality_score".to_string(), json!(0.95));
        memory.metadata.insert("access_count".to_string(), json!(50));
        memory
            .metadata
            .insert("last_accessed_at".to_string(), json!(current_timestamp()));
        storage.store(&memory).await.unwrap();

        engine.run(Horizon::Daily).await.unwrap();

        let stored = storage
            .get_by_hash(&memory.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.metadata_f64("relevance_score").unwrap() <= 1.0);
        assert!(stored.metadata_f64("quality_score").unwrap() <= 1.0);
    }

    #[tokio::test]
    async fn test_weekly_creates_clusters_and_associations() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;

        // A dense topical cluster plus scattered unrelated memories.
        for i in 0..6 {
            let memory = aged(
                &format!("database index rebuild strategy note variant {i}"),
                f64::from(i),
            );
            storage.store(&memory).await.unwrap();
        }
        for (i, topic) in ["gardening tips", "tax filing", "marathon training"]
            .iter()
            .enumerate()
        {
            storage
                .store(&aged(&format!("{topic} memo"), f64::from(i as u32)))
                .await
                .unwrap();
        }

        let report = engine.run(Horizon::Weekly).await.unwrap();
        assert!(report.clusters_found >= 1);
        assert!(report.compressed_created >= 1);

        let summaries = storage
            .search_by_tag(&[CLUSTER_TAG.to_string()], crate::models::TagMatch::Any, None, None)
            .await
            .unwrap();
        assert!(!summaries.is_empty());
        let summary = &summaries[0];
        assert!(summary.metadata.contains_key("source_memory_hashes"));
        assert!(summary.metadata["temporal_span"].get("span_days").is_some());

        // Originals are linked, never deleted
        assert!(storage.count_all_memories(None, None).await.unwrap() >= 9);
    }

    #[tokio::test]
    async fn test_monthly_archives_dormant_memories() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;

        let ancient = aged("long forgotten detail", 200.0);
        let fresh = aged("current work item", 1.0);
        storage.store(&ancient).await.unwrap();
        storage.store(&fresh).await.unwrap();

        let report = engine.run(Horizon::Monthly).await.unwrap();
        assert_eq!(report.archived, 1);

        let archived = storage
            .get_by_hash(&ancient.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(archived.is_archived());
        assert!((archived.created_at - ancient.created_at).abs() < 1e-6);

        let kept = storage.get_by_hash(&fresh.content_hash).await.unwrap().unwrap();
        assert!(!kept.is_archived());
    }

    #[tokio::test]
    async fn test_pause_interrupts_between_batches() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;
        storage.store(&aged("single", 1.0)).await.unwrap();

        engine.pause();
        let report = engine.run(Horizon::Daily).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.relevance_updated, 0);

        engine.resume();
        let report = engine.run(Horizon::Daily).await.unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.relevance_updated, 1);
    }

    #[tokio::test]
    async fn test_status_and_recommendations() {
        let dir = TempDir::new().unwrap();
        let (engine, storage) = engine_with_storage(&dir).await;
        storage.store(&aged("untagged item", 1.0)).await.unwrap();

        let status = engine.status();
        assert!(status.enabled);
        assert!(!status.running);
        assert_eq!(status.total_runs, 0);

        engine.run(Horizon::Daily).await.unwrap();
        let status = engine.status();
        assert_eq!(status.total_runs, 1);
        assert!(status.last_runs.contains_key("daily"));

        let recommendations = engine.recommendations().await.unwrap();
        assert!(recommendations.iter().any(|r| r.contains("no tags")));
    }

    #[tokio::test]
    async fn test_disabled_engine_refuses_to_run() {
        let dir = TempDir::new().unwrap();
        let (_, storage) = engine_with_storage(&dir).await;
        let engine = ConsolidationEngine::new(
            storage,
            ConsolidationConfig {
                enabled: false,
                ..ConsolidationConfig::default()
            },
            GraphStorageMode::GraphOnly,
        );
        assert!(engine.run(Horizon::Daily).await.is_err());
    }
}
