//! Hard limits enforced by the remote adapter.
//!
//! The remote service rejects oversized payloads server-side, but a
//! round-trip to find that out wastes quota and (for the sync engine)
//! retries. The adapter pre-computes sizes locally and fails fast with
//! [`crate::Error::Limit`] before anything touches the network.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Per-record vector metadata cap, bytes (serialized JSON).
pub const MAX_VECTOR_METADATA_BYTES: usize = 10 * 1024;

/// Default content length cap for the 512-token embedding models the
/// service runs.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 800;

/// Default vector index capacity.
pub const DEFAULT_INDEX_CAPACITY: u64 = 5_000_000;

const WARN_RATIO: f64 = 0.80;
const CRITICAL_RATIO: f64 = 0.95;

/// Serialized size of the metadata that would ride on a vector.
#[must_use]
pub fn metadata_size_bytes(metadata: &Map<String, Value>) -> usize {
    Value::Object(metadata.clone()).to_string().len()
}

/// Fails fast when metadata would exceed the per-record cap.
///
/// # Errors
///
/// Returns [`Error::Limit`] with the computed and allowed sizes.
pub fn check_metadata_size(metadata: &Map<String, Value>) -> Result<()> {
    let size = metadata_size_bytes(metadata);
    if size > MAX_VECTOR_METADATA_BYTES {
        return Err(Error::Limit(format!(
            "vector metadata is {size} bytes, cap is {MAX_VECTOR_METADATA_BYTES}"
        )));
    }
    Ok(())
}

/// Tracks approximate vector index occupancy.
///
/// The count is seeded from the service at startup and incremented
/// locally per upsert; it only needs to be accurate enough for the
/// 80 %/95 % warning ladder and the hard pre-check at the cap.
pub struct CapacityTracker {
    used: AtomicU64,
    capacity: u64,
}

impl CapacityTracker {
    /// Creates a tracker with the given capacity.
    #[must_use]
    pub const fn new(capacity: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            capacity,
        }
    }

    /// Seeds the occupancy from a service-reported count.
    pub fn seed(&self, used: u64) {
        self.used.store(used, Ordering::Relaxed);
    }

    /// Current approximate occupancy.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Pre-checks room for `additional` vectors and records them.
    ///
    /// Logs a warning at 80 % and a critical warning at 95 %.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Limit`] when the insert would pass the cap.
    pub fn reserve(&self, additional: u64) -> Result<()> {
        let used = self.used.load(Ordering::Relaxed);
        let after = used.saturating_add(additional);
        if after > self.capacity {
            metrics::counter!("vector_index_full_total").increment(1);
            return Err(Error::Limit(format!(
                "vector index at {used}/{} vectors, cannot add {additional}",
                self.capacity
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = after as f64 / self.capacity as f64;
        if ratio >= CRITICAL_RATIO {
            tracing::warn!(
                used = after,
                capacity = self.capacity,
                "vector index critically full (>= 95%)"
            );
        } else if ratio >= WARN_RATIO {
            tracing::warn!(
                used = after,
                capacity = self.capacity,
                "vector index filling up (>= 80%)"
            );
        }

        self.used.store(after, Ordering::Relaxed);
        Ok(())
    }

    /// Records removed vectors.
    pub fn release(&self, removed: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(removed))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_at_cap_accepted_one_over_rejected() {
        let mut metadata = Map::new();
        // {"p":"<filler>"} serializes with 8 bytes of framing
        let framing = 8;
        let filler = "x".repeat(MAX_VECTOR_METADATA_BYTES - framing);
        metadata.insert("p".to_string(), json!(filler));
        assert_eq!(metadata_size_bytes(&metadata), MAX_VECTOR_METADATA_BYTES);
        assert!(check_metadata_size(&metadata).is_ok());

        let filler = "x".repeat(MAX_VECTOR_METADATA_BYTES - framing + 1);
        metadata.insert("p".to_string(), json!(filler));
        let err = check_metadata_size(&metadata).unwrap_err();
        assert!(matches!(err, Error::Limit(_)));
    }

    #[test]
    fn test_capacity_hard_fail() {
        let tracker = CapacityTracker::new(10);
        tracker.seed(9);
        assert!(tracker.reserve(1).is_ok());
        let err = tracker.reserve(1).unwrap_err();
        assert!(matches!(err, Error::Limit(_)));
        assert_eq!(tracker.used(), 10);
    }

    #[test]
    fn test_capacity_release() {
        let tracker = CapacityTracker::new(10);
        tracker.seed(10);
        tracker.release(4);
        assert_eq!(tracker.used(), 6);
        assert!(tracker.reserve(4).is_ok());
    }
}
