//! Background replication between the primary and secondary backends.
//!
//! A single consumer drains the sync queue in batches. Operations that
//! share a `content_hash` are applied strictly in order; distinct hashes
//! fan out concurrently under a semaphore. Transient failures retry with
//! backoff; limit-class failures are terminal for the operation and
//! counted, never retried.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use super::queue::SyncQueue;
use crate::config::HybridConfig;
use crate::models::{Memory, MetadataPatch, SyncOpKind, SyncOperation};
use crate::storage::MemoryStorage;
use crate::storage::remote::backoff_delay;
use crate::{Result, current_timestamp};

/// Concurrent per-hash dispatches inside one batch.
const SYNC_CONCURRENCY: usize = 15;

/// Retries per operation for transient failures.
const MAX_OP_RETRIES: u32 = 3;

/// Initial reconciliation page size against the secondary.
const INITIAL_SYNC_PAGE: usize = 500;

/// Clock-skew tolerance when comparing `updated_at` across backends.
const DRIFT_TOLERANCE_SECS: f64 = 1.0;

/// Shared counters and flags describing the replication state.
#[derive(Default)]
pub struct SyncState {
    /// Consumer task alive.
    pub running: AtomicBool,
    /// A batch is in flight right now.
    pub actively_syncing: AtomicBool,
    /// Operations replicated successfully.
    pub synced: AtomicU64,
    /// Operations abandoned (permanent error or retries exhausted).
    pub failed: AtomicU64,
    /// Timestamp of the last successful replication.
    pub last_success_at: Mutex<Option<f64>>,
    /// Watermark for drift detection.
    pub last_drift_check: Mutex<f64>,
}

impl SyncState {
    fn record_success(&self) {
        self.synced.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_success_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Some(current_timestamp());
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync_op_failed_total").increment(1);
    }
}

/// Applies one queued operation to the secondary.
///
/// A `Duplicate` on store and a missing row on delete both count as
/// success: the secondary is already in the desired state.
pub async fn apply_operation(
    secondary: &Arc<dyn MemoryStorage>,
    op: &SyncOperation,
) -> Result<()> {
    match op.kind {
        SyncOpKind::Store => {
            let Some(memory) = op.memory.as_deref() else {
                return Ok(());
            };
            match secondary.store(memory).await {
                Err(crate::Error::Duplicate { .. }) | Ok(()) => Ok(()),
                Err(e) => Err(e),
            }
        },
        SyncOpKind::UpdateMetadata => {
            let patch = op.patch.clone().unwrap_or_default();
            // preserve_timestamps=false with an explicit updated_at makes
            // the secondary mirror the primary's clock instead of its own;
            // created_at is immutable on both sides regardless.
            secondary
                .update_memory_metadata(&op.content_hash, &patch, false)
                .await
                .map(|_| ())
        },
        SyncOpKind::Delete => secondary.delete(&op.content_hash).await.map(|_| ()),
    }
}

async fn apply_with_retries(
    secondary: &Arc<dyn MemoryStorage>,
    mut op: SyncOperation,
    state: &SyncState,
) {
    loop {
        match apply_operation(secondary, &op).await {
            Ok(()) => {
                state.record_success();
                return;
            },
            Err(e) if e.is_transient() && op.attempt_count < MAX_OP_RETRIES => {
                op.attempt_count += 1;
                tracing::warn!(
                    kind = op.kind.as_str(),
                    content_hash = %op.content_hash,
                    attempt = op.attempt_count,
                    error = %e,
                    "sync op failed, retrying"
                );
                tokio::time::sleep(backoff_delay(op.attempt_count)).await;
            },
            Err(e) => {
                tracing::error!(
                    kind = op.kind.as_str(),
                    content_hash = %op.content_hash,
                    attempts = op.attempt_count,
                    error = %e,
                    "sync op abandoned"
                );
                state.record_failure();
                return;
            },
        }
    }
}

/// Drains one batch, dispatching per-hash groups concurrently while
/// keeping each hash's operations FIFO.
pub async fn process_batch(
    queue: &SyncQueue,
    secondary: &Arc<dyn MemoryStorage>,
    state: &Arc<SyncState>,
    batch_size: usize,
) -> usize {
    let ops = queue.drain(batch_size);
    if ops.is_empty() {
        return 0;
    }
    let count = ops.len();
    state.actively_syncing.store(true, Ordering::Release);

    // Group by hash, preserving first-seen order inside each group.
    let mut groups: Vec<(String, Vec<SyncOperation>)> = Vec::new();
    for op in ops {
        if let Some((_, group)) = groups.iter_mut().find(|(hash, _)| *hash == op.content_hash) {
            group.push(op);
        } else {
            groups.push((op.content_hash.clone(), vec![op]));
        }
    }

    let semaphore = Arc::new(Semaphore::new(SYNC_CONCURRENCY));
    let mut handles = Vec::with_capacity(groups.len());
    for (_, group) in groups {
        let semaphore = Arc::clone(&semaphore);
        let secondary = Arc::clone(secondary);
        let state = Arc::clone(state);
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            for op in group {
                apply_with_retries(&secondary, op, &state).await;
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    state.actively_syncing.store(false, Ordering::Release);
    count
}

/// The background consumer plus its periodic maintenance loops.
pub struct BackgroundSyncService {
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundSyncService {
    /// Spawns the consumer, drift-check, and tombstone-purge loops.
    #[must_use]
    pub fn spawn(
        queue: Arc<SyncQueue>,
        primary: Arc<dyn MemoryStorage>,
        secondary: Arc<dyn MemoryStorage>,
        state: Arc<SyncState>,
        config: &HybridConfig,
        tombstone_retention_days: u32,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stopping = Arc::new(AtomicBool::new(false));
        state.running.store(true, Ordering::Release);

        let mut workers = Vec::new();

        // Consumer: woken by enqueues, with the interval as a floor.
        {
            let queue = Arc::clone(&queue);
            let secondary = Arc::clone(&secondary);
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let stopping = Arc::clone(&stopping);
            let interval = Duration::from_secs(config.sync_interval_secs.max(1));
            let batch_size = config.batch_size.max(1);
            workers.push(tokio::spawn(async move {
                loop {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    // Drain everything available, then sleep.
                    while process_batch(&queue, &secondary, &state, batch_size).await > 0 {}
                    tokio::select! {
                        () = queue.work_ready.notified() => {},
                        () = shutdown.notified() => break,
                        () = tokio::time::sleep(interval) => {},
                    }
                }
                state.running.store(false, Ordering::Release);
            }));
        }

        // Drift detection.
        if config.sync_updates {
            let primary = Arc::clone(&primary);
            let secondary = Arc::clone(&secondary);
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let stopping = Arc::clone(&stopping);
            let interval = Duration::from_secs(config.drift_check_interval_secs.max(1));
            let batch = config.drift_batch_size.max(1);
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.notified() => break,
                        () = tokio::time::sleep(interval) => {},
                    }
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = detect_drift(&primary, &secondary, &state, batch, false).await
                    {
                        tracing::warn!(error = %e, "drift check failed");
                    }
                }
            }));
        }

        // Tombstone purge, daily.
        {
            let primary = Arc::clone(&primary);
            let secondary = Arc::clone(&secondary);
            let shutdown = Arc::clone(&shutdown);
            let stopping = Arc::clone(&stopping);
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.notified() => break,
                        () = tokio::time::sleep(Duration::from_secs(86_400)) => {},
                    }
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    for (side, storage) in [("primary", &primary), ("secondary", &secondary)] {
                        match storage.purge_deleted(tombstone_retention_days).await {
                            Ok(purged) if purged > 0 => {
                                tracing::info!(side, purged, "tombstone purge");
                            },
                            Ok(_) => {},
                            Err(e) => tracing::warn!(side, error = %e, "tombstone purge failed"),
                        }
                    }
                }
            }));
        }

        Self {
            shutdown,
            stopping,
            workers: Mutex::new(workers),
        }
    }

    /// Signals every loop to stop and waits for them to finish.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// Compares `updated_at` watermarks across backends and converges
/// metadata; the newer side wins with a one-second skew tolerance.
///
/// In dry-run mode intended writes are logged but not performed.
///
/// # Errors
///
/// Returns the first storage error encountered.
pub async fn detect_drift(
    primary: &Arc<dyn MemoryStorage>,
    secondary: &Arc<dyn MemoryStorage>,
    state: &SyncState,
    batch: usize,
    dry_run: bool,
) -> Result<usize> {
    let since = {
        *state
            .last_drift_check
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
    let started_at = current_timestamp();

    let local_changes = primary.get_memories_updated_since(since, batch).await?;
    let remote_changes = secondary.get_memories_updated_since(since, batch).await?;
    let mut converged = 0;

    for remote in &remote_changes {
        let local = primary.get_by_hash(&remote.content_hash).await?;
        let local_updated = match &local {
            Some(memory) => memory.updated_at,
            None if primary.is_deleted(&remote.content_hash).await? => {
                // Local tombstone: the deletion wins over any remote edit.
                continue;
            },
            None => 0.0,
        };
        if remote.updated_at > local_updated + DRIFT_TOLERANCE_SECS {
            converged += 1;
            if dry_run {
                tracing::info!(
                    content_hash = %remote.content_hash,
                    "dry-run: would pull newer remote state"
                );
                continue;
            }
            apply_newer(primary, remote, local.is_some()).await?;
        }
    }

    for local in &local_changes {
        let remote = secondary.get_by_hash(&local.content_hash).await?;
        let remote_updated = remote.as_ref().map_or(0.0, |m| m.updated_at);
        if local.updated_at > remote_updated + DRIFT_TOLERANCE_SECS {
            converged += 1;
            if dry_run {
                tracing::info!(
                    content_hash = %local.content_hash,
                    "dry-run: would push newer local state"
                );
                continue;
            }
            apply_newer(secondary, local, remote.is_some()).await?;
        }
    }

    let mut watermark = state
        .last_drift_check
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *watermark = started_at;
    drop(watermark);

    if converged > 0 {
        tracing::info!(converged, dry_run, "drift check converged records");
        metrics::counter!("drift_converged_total").increment(converged as u64);
    }
    Ok(converged)
}

/// Writes the newer side's state onto `target`.
///
/// All four timestamp fields travel explicitly; the source `created_at`
/// is always the one preserved.
async fn apply_newer(
    target: &Arc<dyn MemoryStorage>,
    newer: &Memory,
    exists_on_target: bool,
) -> Result<()> {
    if newer.is_deleted() {
        target.delete(&newer.content_hash).await.map(|_| ())
    } else if exists_on_target {
        let patch = MetadataPatch {
            tags: Some(newer.tags.clone()),
            memory_type: newer.memory_type.clone(),
            metadata: Some(newer.metadata.clone()),
            updated_at: Some(newer.updated_at),
        };
        target
            .update_memory_metadata(&newer.content_hash, &patch, false)
            .await
            .map(|_| ())
    } else {
        match target.store(newer).await {
            Err(crate::Error::Duplicate { .. }) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// One-time reconciliation run at startup.
///
/// Pages the secondary, inserting records missing locally (timestamps
/// preserved) and pushing local tombstones back as remote deletions so a
/// deleted memory is never resurrected. Existing records are left to
/// drift detection.
///
/// # Errors
///
/// Returns the first storage error encountered.
pub async fn initial_reconciliation(
    primary: &Arc<dyn MemoryStorage>,
    secondary: &Arc<dyn MemoryStorage>,
) -> Result<ReconciliationReport> {
    let started = std::time::Instant::now();
    let local_hashes = primary.get_all_content_hashes().await?;
    let mut report = ReconciliationReport::default();

    let semaphore = Arc::new(Semaphore::new(SYNC_CONCURRENCY));
    let mut offset = 0;
    loop {
        let page = secondary
            .get_all_memories(INITIAL_SYNC_PAGE, offset, None, None)
            .await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();

        let mut handles = Vec::new();
        for memory in page {
            if local_hashes.contains(&memory.content_hash) {
                report.already_present += 1;
                continue;
            }
            let primary = Arc::clone(primary);
            let secondary = Arc::clone(secondary);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (0_usize, 0_usize, 1_usize);
                };
                // A local tombstone outranks the remote copy: push the
                // deletion out instead of pulling the record back in.
                match primary.is_deleted(&memory.content_hash).await {
                    Ok(true) => {
                        let pushed = secondary.delete(&memory.content_hash).await.is_ok();
                        (0, usize::from(pushed), usize::from(!pushed))
                    },
                    Ok(false) => match primary.store(&memory).await {
                        Ok(()) | Err(crate::Error::Duplicate { .. }) => (1, 0, 0),
                        Err(e) => {
                            tracing::warn!(
                                content_hash = %memory.content_hash,
                                error = %e,
                                "initial sync insert failed"
                            );
                            (0, 0, 1)
                        },
                    },
                    Err(e) => {
                        tracing::warn!(
                            content_hash = %memory.content_hash,
                            error = %e,
                            "initial sync tombstone check failed"
                        );
                        (0, 0, 1)
                    },
                }
            }));
        }
        for handle in handles {
            if let Ok((pulled, deletions, failures)) = handle.await {
                report.pulled += pulled;
                report.deletions_pushed += deletions;
                report.failures += failures;
            }
        }
    }

    report.elapsed = started.elapsed();
    tracing::info!(
        pulled = report.pulled,
        deletions_pushed = report.deletions_pushed,
        already_present = report.already_present,
        failures = report.failures,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "initial reconciliation finished"
    );
    Ok(report)
}

/// Outcome of [`initial_reconciliation`].
#[derive(Debug, Default, Clone)]
pub struct ReconciliationReport {
    /// Records inserted into the primary.
    pub pulled: usize,
    /// Local tombstones pushed to the secondary as deletions.
    pub deletions_pushed: usize,
    /// Records already on both sides.
    pub already_present: usize,
    /// Records that could not be reconciled.
    pub failures: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}
