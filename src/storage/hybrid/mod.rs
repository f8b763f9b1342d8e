//! Hybrid storage engine.
//!
//! Composes a fast local primary with a durable remote secondary. Every
//! read is served by the primary; every successful primary write
//! enqueues a replication op that a background consumer applies to the
//! secondary. Callers never wait on the secondary, and the system keeps
//! serving from the primary when the secondary is unreachable.

mod queue;
mod service;

pub use queue::{ENQUEUE_WAIT, EnqueueOutcome, SyncQueue};
pub use service::{
    BackgroundSyncService, ReconciliationReport, SyncState, apply_operation, detect_drift,
    initial_reconciliation, process_batch,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use crate::config::{Config, HybridConfig, SyncOwner};
use crate::models::{
    Association, Direction, GraphPath, Memory, MemoryQueryResult, MetadataPatch, Subgraph,
    SyncOperation, SyncStatus, TagMatch,
};
use crate::storage::{MemoryStorage, StorageStats};
use crate::Result;

/// Local-primary, remote-secondary composite backend.
pub struct HybridStorage {
    primary: Arc<dyn MemoryStorage>,
    secondary: Arc<dyn MemoryStorage>,
    queue: Arc<SyncQueue>,
    state: Arc<SyncState>,
    service: Mutex<Option<BackgroundSyncService>>,
    hybrid_config: HybridConfig,
    tombstone_retention_days: u32,
    owner: SyncOwner,
}

impl HybridStorage {
    /// Composes two backends under the hybrid write/sync policy.
    #[must_use]
    pub fn new(
        primary: Arc<dyn MemoryStorage>,
        secondary: Arc<dyn MemoryStorage>,
        config: &Config,
    ) -> Self {
        Self {
            primary,
            secondary,
            queue: Arc::new(SyncQueue::new(config.hybrid.max_queue_size)),
            state: Arc::new(SyncState::default()),
            service: Mutex::new(None),
            hybrid_config: config.hybrid.clone(),
            tombstone_retention_days: config.tombstone_retention_days,
            owner: config.hybrid.sync_owner,
        }
    }

    /// The local primary, for callers needing direct access (tests,
    /// maintenance tooling).
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn MemoryStorage> {
        &self.primary
    }

    /// Enqueues a replication op, falling back to a direct synchronous
    /// secondary write when the queue stays full past the grace period.
    async fn replicate(&self, op: SyncOperation) {
        match self.queue.enqueue(op).await {
            EnqueueOutcome::Queued => {},
            EnqueueOutcome::Paused => {
                tracing::debug!("sync paused, replication op skipped");
            },
            EnqueueOutcome::Full(op) => {
                tracing::warn!(
                    kind = op.kind.as_str(),
                    "sync queue full, writing through to secondary"
                );
                if let Err(e) = apply_operation(&self.secondary, &op).await {
                    tracing::error!(error = %e, "write-through to secondary failed");
                    self.state.failed.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    /// Patch mirroring a primary-side memory onto the secondary.
    fn mirror_patch(memory: &Memory) -> MetadataPatch {
        MetadataPatch {
            tags: Some(memory.tags.clone()),
            memory_type: memory.memory_type.clone(),
            metadata: Some(memory.metadata.clone()),
            updated_at: Some(memory.updated_at),
        }
    }

    /// Pauses dispatch and enqueue.
    pub fn pause_sync(&self) {
        self.queue.pause();
    }

    /// Resumes dispatch and enqueue.
    pub fn resume_sync(&self) {
        self.queue.resume();
    }

    /// Drains the queue to the secondary immediately; returns the number
    /// of operations processed.
    pub async fn force_sync(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = process_batch(
                &self.queue,
                &self.secondary,
                &self.state,
                self.hybrid_config.batch_size.max(1),
            )
            .await;
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    /// Runs a drift check now.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn drift_check(&self, dry_run: bool) -> Result<usize> {
        detect_drift(
            &self.primary,
            &self.secondary,
            &self.state,
            self.hybrid_config.drift_batch_size.max(1),
            dry_run,
        )
        .await
    }

    /// Runs the startup reconciliation pass and waits for it.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn run_initial_reconciliation(&self) -> Result<ReconciliationReport> {
        initial_reconciliation(&self.primary, &self.secondary).await
    }

    /// Current replication status snapshot.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            running: self.state.running.load(Ordering::Acquire),
            paused: self.queue.is_paused(),
            actively_syncing: self.state.actively_syncing.load(Ordering::Acquire),
            pending: self.queue.len(),
            failed: self.state.failed.load(Ordering::Relaxed),
            synced: self.state.synced.load(Ordering::Relaxed),
            last_success_at: *self
                .state
                .last_success_at
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            owner: self.owner.as_str().to_string(),
        }
    }
}

#[async_trait]
impl MemoryStorage for HybridStorage {
    async fn initialize(&self) -> Result<()> {
        self.primary.initialize().await?;
        // A dead secondary must not take the whole system down; the
        // queue absorbs writes until it comes back.
        if let Err(e) = self.secondary.initialize().await {
            tracing::warn!(error = %e, "secondary initialization failed, continuing local-only");
        }

        let service = BackgroundSyncService::spawn(
            Arc::clone(&self.queue),
            Arc::clone(&self.primary),
            Arc::clone(&self.secondary),
            Arc::clone(&self.state),
            &self.hybrid_config,
            self.tombstone_retention_days,
        );
        let mut guard = self
            .service
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(service);
        drop(guard);

        // Startup reconciliation runs off the caller's path.
        let primary = Arc::clone(&self.primary);
        let secondary = Arc::clone(&self.secondary);
        tokio::spawn(async move {
            if let Err(e) = initial_reconciliation(&primary, &secondary).await {
                tracing::warn!(error = %e, "initial reconciliation failed");
            }
        });
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "hybrid"
    }

    fn max_content_length(&self) -> Option<usize> {
        // The stricter side governs: everything stored locally must also
        // fit the secondary.
        self.secondary
            .max_content_length()
            .or_else(|| self.primary.max_content_length())
    }

    async fn store(&self, memory: &Memory) -> Result<()> {
        self.primary.store(memory).await?;
        // Re-read so the queued op carries the stored embedding and the
        // exact persisted timestamps.
        let stored = self
            .primary
            .get_by_hash(&memory.content_hash)
            .await?
            .unwrap_or_else(|| memory.clone());
        self.replicate(SyncOperation::store(stored)).await;
        Ok(())
    }

    async fn update_memory(&self, memory: &Memory) -> Result<()> {
        self.primary.update_memory(memory).await?;
        self.replicate(SyncOperation::update_metadata(
            memory.content_hash.clone(),
            Self::mirror_patch(memory),
        ))
        .await;
        Ok(())
    }

    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        let outcomes = self.primary.update_memories_batch(memories).await?;
        for (memory, updated) in memories.iter().zip(&outcomes) {
            if *updated {
                self.replicate(SyncOperation::update_metadata(
                    memory.content_hash.clone(),
                    Self::mirror_patch(memory),
                ))
                .await;
            }
        }
        Ok(outcomes)
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: &MetadataPatch,
        preserve_timestamps: bool,
    ) -> Result<Memory> {
        let updated = self
            .primary
            .update_memory_metadata(content_hash, patch, preserve_timestamps)
            .await?;
        self.replicate(SyncOperation::update_metadata(
            content_hash.to_string(),
            Self::mirror_patch(&updated),
        ))
        .await;
        Ok(updated)
    }

    async fn delete(&self, content_hash: &str) -> Result<bool> {
        let deleted = self.primary.delete(content_hash).await?;
        if deleted {
            self.replicate(SyncOperation::delete(content_hash.to_string()))
                .await;
        }
        Ok(deleted)
    }

    async fn delete_by_tags(&self, tags: &[String], match_mode: TagMatch) -> Result<usize> {
        let affected = self
            .primary
            .search_by_tag(tags, match_mode, None, None)
            .await?;
        let count = self.primary.delete_by_tags(tags, match_mode).await?;
        for memory in affected {
            self.replicate(SyncOperation::delete(memory.content_hash)).await;
        }
        Ok(count)
    }

    async fn delete_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<usize> {
        let affected = self
            .primary
            .search_by_timeframe(time_start, time_end, tag)
            .await?;
        let count = self
            .primary
            .delete_by_timeframe(time_start, time_end, tag)
            .await?;
        for memory in affected {
            self.replicate(SyncOperation::delete(memory.content_hash)).await;
        }
        Ok(count)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        self.primary.get_by_hash(content_hash).await
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        self.primary.get_by_exact_content(content).await
    }

    async fn get_all_memories(
        &self,
        limit: usize,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        self.primary
            .get_all_memories(limit, offset, memory_type, tags)
            .await
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        self.primary.count_all_memories(memory_type, tags).await
    }

    async fn count_untagged_memories(&self) -> Result<usize> {
        self.primary.count_untagged_memories().await
    }

    async fn delete_untagged_memories(&self) -> Result<usize> {
        let affected = self.primary.get_all_memories(usize::MAX, 0, None, None).await?;
        let count = self.primary.delete_untagged_memories().await?;
        for memory in affected.into_iter().filter(|m| m.tags.is_empty()) {
            self.replicate(SyncOperation::delete(memory.content_hash)).await;
        }
        Ok(count)
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemoryQueryResult>> {
        self.primary.retrieve(query, k).await
    }

    async fn recall(
        &self,
        query: Option<&str>,
        k: usize,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<MemoryQueryResult>> {
        self.primary.recall(query, k, time_start, time_end).await
    }

    async fn search_by_tag(
        &self,
        tags: &[String],
        match_mode: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>> {
        self.primary
            .search_by_tag(tags, match_mode, time_start, time_end)
            .await
    }

    async fn search_by_timeframe(
        &self,
        time_start: f64,
        time_end: f64,
        tag: Option<&str>,
    ) -> Result<Vec<Memory>> {
        self.primary
            .search_by_timeframe(time_start, time_end, tag)
            .await
    }

    async fn get_memory_timestamps(&self) -> Result<Vec<(String, f64, f64)>> {
        self.primary.get_memory_timestamps().await
    }

    async fn get_memories_updated_since(&self, since: f64, limit: usize) -> Result<Vec<Memory>> {
        self.primary.get_memories_updated_since(since, limit).await
    }

    async fn get_all_content_hashes(&self) -> Result<HashSet<String>> {
        self.primary.get_all_content_hashes().await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let mut stats = self.primary.get_stats().await?;
        stats.backend = self.backend_name().to_string();
        Ok(stats)
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        self.primary.is_deleted(content_hash).await
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let purged = self.primary.purge_deleted(older_than_days).await?;
        if let Err(e) = self.secondary.purge_deleted(older_than_days).await {
            tracing::warn!(error = %e, "secondary tombstone purge failed");
        }
        Ok(purged)
    }

    async fn store_association(&self, association: &Association) -> Result<()> {
        self.primary.store_association(association).await
    }

    async fn find_connected(
        &self,
        content_hash: &str,
        max_hops: usize,
        direction: Direction,
    ) -> Result<Vec<(String, usize)>> {
        self.primary
            .find_connected(content_hash, max_hops, direction)
            .await
    }

    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<GraphPath>> {
        self.primary.shortest_path(from, to).await
    }

    async fn get_subgraph(&self, content_hash: &str, radius: usize) -> Result<Subgraph> {
        self.primary.get_subgraph(content_hash, radius).await
    }

    async fn get_associations(&self, content_hash: &str) -> Result<Vec<Association>> {
        self.primary.get_associations(content_hash).await
    }

    async fn sync_status(&self) -> Result<SyncStatus> {
        Ok(self.status())
    }

    async fn close(&self) -> Result<()> {
        let service = {
            let mut guard = self
                .service
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(service) = service {
            // Drain what we can before stopping the workers.
            let drained = self.force_sync().await;
            if drained > 0 {
                tracing::info!(drained, "flushed sync queue on shutdown");
            }
            service.stop().await;
        }
        self.primary.close().await?;
        self.secondary.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_timestamp;
    use crate::embedding::HashedEmbedder;
    use crate::storage::sqlite::SqliteStorage;
    use serde_json::Map;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn sqlite_store(dir: &TempDir, name: &str) -> Arc<dyn MemoryStorage> {
        Arc::new(
            SqliteStorage::new(
                &dir.path().join(name),
                Arc::new(HashedEmbedder::new()),
                &Config::default(),
            )
            .unwrap(),
        )
    }

    async fn hybrid(dir: &TempDir) -> HybridStorage {
        let primary = sqlite_store(dir, "primary.db");
        let secondary = sqlite_store(dir, "secondary.db");
        primary.initialize().await.unwrap();
        secondary.initialize().await.unwrap();
        // Background workers are exercised separately; tests drive the
        // queue with force_sync for determinism.
        HybridStorage::new(primary, secondary, &Config::default())
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
    async fn test_write_enqueues_only_on_primary_success() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        let memory = make_memory("queued once", &[]);
        storage.store(&memory).await.unwrap();
        assert_eq!(storage.status().pending, 1);

        // Duplicate fails on the primary; nothing further is enqueued.
        assert!(storage.store(&memory).await.is_err());
        assert_eq!(storage.status().pending, 1);
    }

    #[tokio::test]
    async fn test_store_replicates_with_preserved_timestamps() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        let memory = make_memory("replicate me", &["sync"]);
        storage.store(&memory).await.unwrap();
        let drained = storage.force_sync().await;
        assert_eq!(drained, 1);

        let replica = storage
            .secondary
            .get_by_hash(&memory.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.content, "replicate me");
        assert!((replica.created_at - memory.created_at).abs() < 1.0);
        assert!((replica.updated_at - memory.updated_at).abs() < 1.0);

        let status = storage.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.synced, 1);
        assert!(status.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_propagates_as_soft_delete() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        let memory = make_memory("delete across", &[]);
        storage.store(&memory).await.unwrap();
        storage.force_sync().await;

        assert!(storage.delete(&memory.content_hash).await.unwrap());
        storage.force_sync().await;

        assert!(
            storage
                .secondary
                .get_by_hash(&memory.content_hash)
                .await
                .unwrap()
                .is_none()
        );
        assert!(storage.secondary.is_deleted(&memory.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_initial_reconciliation_pulls_missing_and_respects_tombstones() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        // Remote-only record: should be pulled in with timestamps kept.
        let mut remote_only = make_memory("exists remotely", &["remote"]);
        remote_only.created_at -= 5_000.0;
        remote_only.updated_at = remote_only.created_at;
        remote_only.normalize_timestamps();
        storage.secondary.store(&remote_only).await.unwrap();

        // Locally tombstoned record still present remotely: the deletion
        // must win, never a resurrection.
        let deleted_here = make_memory("deleted on this host", &[]);
        storage.primary.store(&deleted_here).await.unwrap();
        storage.secondary.store(&deleted_here).await.unwrap();
        storage.primary.delete(&deleted_here.content_hash).await.unwrap();

        let report = storage.run_initial_reconciliation().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.deletions_pushed, 1);
        assert_eq!(report.failures, 0);

        let pulled = storage
            .primary
            .get_by_hash(&remote_only.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert!((pulled.created_at - remote_only.created_at).abs() < 1.0);

        assert!(
            storage
                .primary
                .get_by_hash(&deleted_here.content_hash)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            storage
                .secondary
                .is_deleted(&deleted_here.content_hash)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_enqueue_and_resume_restores() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        storage.pause_sync();
        let memory = make_memory("written while paused", &[]);
        storage.store(&memory).await.unwrap();
        // Local write landed; nothing was enqueued.
        assert!(storage.get_by_hash(&memory.content_hash).await.unwrap().is_some());
        assert_eq!(storage.status().pending, 0);
        assert!(storage.status().paused);

        storage.resume_sync();
        let memory = make_memory("written after resume", &[]);
        storage.store(&memory).await.unwrap();
        assert_eq!(storage.status().pending, 1);
        assert!(!storage.status().paused);
    }

    #[tokio::test]
    async fn test_drift_detection_newer_side_wins() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        let memory = make_memory("drifting", &["v1"]);
        storage.primary.store(&memory).await.unwrap();
        storage.secondary.store(&memory).await.unwrap();

        // Make the secondary's copy strictly newer with different tags.
        let patch = MetadataPatch {
            tags: Some(vec!["v2".to_string()]),
            updated_at: Some(current_timestamp() + 30.0),
            ..Default::default()
        };
        storage
            .secondary
            .update_memory_metadata(&memory.content_hash, &patch, false)
            .await
            .unwrap();

        let converged = storage.drift_check(false).await.unwrap();
        assert_eq!(converged, 1);

        let local = storage
            .primary
            .get_by_hash(&memory.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.tags, vec!["v2"]);
        // created_at survives the convergence
        assert!((local.created_at - memory.created_at).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_drift_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        let memory = make_memory("dry run subject", &["before"]);
        storage.primary.store(&memory).await.unwrap();
        storage.secondary.store(&memory).await.unwrap();
        let patch = MetadataPatch {
            tags: Some(vec!["after".to_string()]),
            updated_at: Some(current_timestamp() + 30.0),
            ..Default::default()
        };
        storage
            .secondary
            .update_memory_metadata(&memory.content_hash, &patch, false)
            .await
            .unwrap();

        storage.drift_check(true).await.unwrap();
        let local = storage
            .primary
            .get_by_hash(&memory.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.tags, vec!["before"]);
    }

    #[tokio::test]
    async fn test_delete_by_tag_propagates_each_hash() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        storage.store(&make_memory("one", &["sweep"])).await.unwrap();
        storage.store(&make_memory("two", &["sweep"])).await.unwrap();
        storage.store(&make_memory("three", &["keep"])).await.unwrap();
        storage.force_sync().await;

        let count = storage
            .delete_by_tags(&["sweep".to_string()], TagMatch::Any)
            .await
            .unwrap();
        assert_eq!(count, 2);
        storage.force_sync().await;

        assert_eq!(
            storage.secondary.count_all_memories(None, None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_reads_are_served_by_primary() {
        let dir = TempDir::new().unwrap();
        let storage = hybrid(&dir).await;

        // Present only on the secondary: invisible to reads.
        let remote_only = make_memory("remote only", &[]);
        storage.secondary.store(&remote_only).await.unwrap();

        assert!(
            storage
                .get_by_hash(&remote_only.content_hash)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 0);
    }
}
