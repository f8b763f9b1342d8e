//! Bounded sync queue feeding the background replication consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::models::SyncOperation;

/// How long a full queue blocks an enqueue before the caller falls back
/// to a direct synchronous secondary write.
pub const ENQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Result of an enqueue attempt.
#[derive(Debug, PartialEq)]
pub enum EnqueueOutcome {
    /// Accepted; the consumer was notified.
    Queued,
    /// Sync is paused: pausing blocks enqueue as well as dispatch, so
    /// the queue cannot drift during maintenance.
    Paused,
    /// Still full after [`ENQUEUE_WAIT`]; caller must write through
    /// synchronously instead of dropping the operation.
    Full(SyncOperation),
}

/// Bounded FIFO of operations awaiting replication.
pub struct SyncQueue {
    inner: Mutex<VecDeque<SyncOperation>>,
    capacity: usize,
    paused: AtomicBool,
    /// Wakes the consumer on enqueue.
    pub work_ready: Notify,
    /// Wakes blocked producers when room frees up.
    room_freed: Notify,
}

impl SyncQueue {
    /// Creates a queue with the given capacity (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            paused: AtomicBool::new(false),
            work_ready: Notify::new(),
            room_freed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SyncOperation>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Operations currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether enqueue and dispatch are paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Blocks dispatch and enqueue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!("sync queue paused");
    }

    /// Resumes dispatch and enqueue.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.work_ready.notify_one();
        tracing::info!("sync queue resumed");
    }

    fn try_push(&self, op: SyncOperation) -> Option<SyncOperation> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Some(op);
        }
        queue.push_back(op);
        None
    }

    /// Enqueues an operation, waiting up to [`ENQUEUE_WAIT`] on a full
    /// queue.
    pub async fn enqueue(&self, op: SyncOperation) -> EnqueueOutcome {
        if self.is_paused() {
            metrics::counter!("sync_enqueue_paused_total").increment(1);
            return EnqueueOutcome::Paused;
        }

        let mut pending = op;
        let deadline = tokio::time::Instant::now() + ENQUEUE_WAIT;
        loop {
            match self.try_push(pending) {
                None => {
                    metrics::counter!("sync_enqueue_total").increment(1);
                    self.work_ready.notify_one();
                    return EnqueueOutcome::Queued;
                },
                Some(rejected) => {
                    if tokio::time::Instant::now() >= deadline {
                        metrics::counter!("sync_enqueue_overflow_total").increment(1);
                        return EnqueueOutcome::Full(rejected);
                    }
                    pending = rejected;
                    let _ = tokio::time::timeout(
                        deadline - tokio::time::Instant::now(),
                        self.room_freed.notified(),
                    )
                    .await;
                },
            }
        }
    }

    /// Takes up to `max` operations in FIFO order; empty while paused.
    #[must_use]
    pub fn drain(&self, max: usize) -> Vec<SyncOperation> {
        if self.is_paused() {
            return Vec::new();
        }
        let mut queue = self.lock();
        let take = max.min(queue.len());
        let drained: Vec<SyncOperation> = queue.drain(..take).collect();
        drop(queue);
        if !drained.is_empty() {
            self.room_freed.notify_waiters();
        }
        drained
    }

    /// Puts failed operations back at the front, preserving order.
    pub fn requeue_front(&self, ops: Vec<SyncOperation>) {
        let mut queue = self.lock();
        for op in ops.into_iter().rev() {
            queue.push_front(op);
        }
    }
}
