//! Memory record types.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::current_timestamp;

/// Maximum length of a single tag, in characters.
pub const MAX_TAG_LENGTH: usize = 100;

/// Converts a float Unix timestamp to an RFC3339 UTC string.
///
/// Sub-second precision is truncated to milliseconds; the float form stays
/// authoritative. Out-of-range values collapse to the epoch.
#[must_use]
pub fn iso_from_timestamp(ts: f64) -> String {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1_000_000_000.0).round();
    #[allow(clippy::cast_possible_truncation)]
    let dt = Utc
        .timestamp_opt(secs as i64, nanos as u32)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH);
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Boolean combination mode for tag queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// A memory matches if it carries every requested tag.
    All,
    /// A memory matches if it carries at least one requested tag.
    #[default]
    Any,
}

impl TagMatch {
    /// Parses `"and"`/`"all"` and `"or"`/`"any"` spellings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "and" | "all" => Some(Self::All),
            "or" | "any" => Some(Self::Any),
            _ => None,
        }
    }
}

/// A single content-hash-addressed memory record.
///
/// The hash is the primary identity and is immutable after creation: any
/// mutation that would change it is modeled as delete + create. Timestamps
/// are float UTC epoch seconds; the ISO fields are derived conveniences
/// and are recomputed from the floats whenever the two disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// The stored text.
    pub content: String,
    /// SHA-256 over content plus a canonical metadata subset (64 hex chars).
    pub content_hash: String,
    /// Exact-match tags, each at most [`MAX_TAG_LENGTH`] characters.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form type label, e.g. `note`, `decision`, `reference`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    /// Arbitrary metadata. Reserved keys: chunking fields (`is_chunk`,
    /// `chunk_index`, `total_chunks`, `original_length`), quality fields
    /// (`quality_*`, `access_count`, `last_accessed_at`), and
    /// consolidation fields (`relevance_score`, `archived`,
    /// `source_memory_hashes`, `temporal_span`).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Embedding vector; `None` until computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Creation time, float UTC epoch seconds.
    pub created_at: f64,
    /// RFC3339 mirror of `created_at`.
    pub created_at_iso: String,
    /// Last update time, float UTC epoch seconds. Always `>= created_at`.
    pub updated_at: f64,
    /// RFC3339 mirror of `updated_at`.
    pub updated_at_iso: String,
    /// Tombstone timestamp; non-null means soft-deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<f64>,
}

impl Memory {
    /// Creates a memory stamped with the current time.
    ///
    /// The caller supplies the pre-computed content hash (see
    /// `services::ContentHasher`); the embedding is attached later by the
    /// storage layer.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        content_hash: impl Into<String>,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = current_timestamp();
        Self {
            content: content.into(),
            content_hash: content_hash.into(),
            tags,
            memory_type,
            metadata,
            embedding: None,
            created_at: now,
            created_at_iso: iso_from_timestamp(now),
            updated_at: now,
            updated_at_iso: iso_from_timestamp(now),
            deleted_at: None,
        }
    }

    /// Whether this record is a tombstone.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Advances `updated_at` to now. `created_at` is never touched.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp();
        self.updated_at_iso = iso_from_timestamp(self.updated_at);
    }

    /// Recomputes both ISO fields from their float counterparts.
    ///
    /// The float form is authoritative; a drifted ISO string (more than
    /// one second off) is overwritten.
    pub fn normalize_timestamps(&mut self) {
        self.created_at_iso = iso_from_timestamp(self.created_at);
        self.updated_at_iso = iso_from_timestamp(self.updated_at);
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
            self.updated_at_iso.clone_from(&self.created_at_iso);
        }
    }

    /// Reads a float metadata field, tolerating integer JSON numbers.
    #[must_use]
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    /// Reads an unsigned-int metadata field.
    #[must_use]
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Whether consolidation has archived this memory.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.metadata
            .get("archived")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this memory is a chunk of a larger stored text.
    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.metadata
            .get("is_chunk")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A query hit: a memory plus backend-reported ranking information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQueryResult {
    /// The matching memory.
    pub memory: Memory,
    /// Cosine-derived similarity in `[0, 1]`, higher is closer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    /// Backend-native distance (cosine distance in `[0, 2]` for the local
    /// store).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// A partial update applied to a memory's mutable fields.
///
/// `content` and `content_hash` are deliberately absent: identity is
/// immutable. `created_at` is likewise absent; only `updated_at` can be
/// carried, and only when timestamps are not preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// Replacement tag set (already normalized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Replacement type label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    /// Keys merged into the existing metadata map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Explicit `updated_at` used only with `preserve_timestamps = false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<f64>,
}

impl MetadataPatch {
    /// Whether the patch carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.memory_type.is_none()
            && self.metadata.is_none()
            && self.updated_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_memory_timestamps_agree() {
        let m = Memory::new("content", "ab".repeat(32), vec![], None, Map::new());
        assert!(m.created_at <= m.updated_at);
        assert_eq!(m.created_at_iso, iso_from_timestamp(m.created_at));
        assert!(!m.is_deleted());
    }

    #[test]
    fn test_touch_preserves_created_at() {
        let mut m = Memory::new("content", "ab".repeat(32), vec![], None, Map::new());
        let created = m.created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.touch();
        assert!((m.created_at - created).abs() < f64::EPSILON);
        assert!(m.updated_at > created);
    }

    #[test]
    fn test_normalize_timestamps_float_wins() {
        let mut m = Memory::new("content", "ab".repeat(32), vec![], None, Map::new());
        m.created_at = 1_700_000_000.0;
        m.created_at_iso = "1999-01-01T00:00:00Z".to_string();
        m.updated_at = 1_700_000_100.0;
        m.normalize_timestamps();
        assert!(m.created_at_iso.starts_with("2023-11-14"));
    }

    #[test]
    fn test_normalize_timestamps_repairs_inversion() {
        let mut m = Memory::new("content", "ab".repeat(32), vec![], None, Map::new());
        m.created_at = 2_000.0;
        m.updated_at = 1_000.0;
        m.normalize_timestamps();
        assert!((m.updated_at - m.created_at).abs() < f64::EPSILON);
    }

    #[test]
    fn test_iso_round_trip_within_a_second() {
        let ts = 1_712_345_678.25_f64;
        let iso = iso_from_timestamp(ts);
        let parsed = DateTime::parse_from_rfc3339(&iso)
            .map(|dt| dt.timestamp_millis() as f64 / 1_000.0)
            .unwrap_or(0.0);
        assert!((parsed - ts).abs() < 1.0);
    }

    #[test]
    fn test_tag_match_parse() {
        assert_eq!(TagMatch::parse("AND"), Some(TagMatch::All));
        assert_eq!(TagMatch::parse("all"), Some(TagMatch::All));
        assert_eq!(TagMatch::parse("or"), Some(TagMatch::Any));
        assert_eq!(TagMatch::parse("any"), Some(TagMatch::Any));
        assert_eq!(TagMatch::parse("xor"), None);
    }

    #[test]
    fn test_metadata_patch_is_empty() {
        assert!(MetadataPatch::default().is_empty());
        let patch = MetadataPatch {
            tags: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
