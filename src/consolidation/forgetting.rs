//! Controlled forgetting.
//!
//! Memories that have decayed below the relevance floor and sat
//! unaccessed past the dormancy window are archived, not deleted:
//! `metadata.archived = true` removes them from default retrieval while
//! keeping them reachable with an explicit flag. Quality-based retention
//! tiers protect good memories longer.

use serde_json::json;

use crate::models::Memory;
use crate::quality::retention_days;

/// Relevance below which a memory becomes an archival candidate.
pub const RELEVANCE_FLOOR: f64 = 0.1;

/// Days without access before a candidate is actually archived.
pub const DORMANCY_DAYS: f64 = 90.0;

/// Whether `memory` qualifies for archival at `now`.
///
/// Three gates, all required: decayed relevance, dormancy, and an age
/// past the quality tier's retention window.
#[must_use]
pub fn is_archivable(memory: &Memory, relevance: f64, now: f64) -> bool {
    if memory.is_archived() {
        return false;
    }
    if relevance >= RELEVANCE_FLOOR {
        return false;
    }

    let last_touch = memory
        .metadata_f64("last_accessed_at")
        .unwrap_or(memory.created_at);
    if (now - last_touch) / 86_400.0 < DORMANCY_DAYS {
        return false;
    }

    let quality = memory.metadata_f64("quality_score").unwrap_or(0.0);
    let retention = f64::from(retention_days(quality));
    (now - memory.created_at) / 86_400.0 >= retention
}

/// Marks a memory archived, stamping when and why.
pub fn archive(memory: &mut Memory, relevance: f64, now: f64) {
    memory.metadata.insert("archived".to_string(), json!(true));
    memory
        .metadata
        .insert("archived_at".to_string(), json!(now));
    memory.metadata.insert(
        "archived_reason".to_string(),
        json!(format!("relevance {relevance:.3} below floor, dormant")),
    );
    memory.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_timestamp;
    use serde_json::Map;

    fn dormant_memory(age_days: f64, quality: Option<f64>) -> Memory {
        let mut memory = Memory::new(
            "forgettable",
            "ab".repeat(32),
            vec![],
            None,
            Map::new(),
        );
        memory.created_at = current_timestamp() - age_days * 86_400.0;
        memory.updated_at = memory.created_at;
        memory.normalize_timestamps();
        if let Some(quality) = quality {
            memory
                .metadata
                .insert("quality_score".to_string(), json!(quality));
        }
        memory
    }

    #[test]
    fn test_low_relevance_dormant_old_memory_is_archivable() {
        let memory = dormant_memory(120.0, None);
        assert!(is_archivable(&memory, 0.05, current_timestamp()));
    }

    #[test]
    fn test_relevance_floor_gate() {
        let memory = dormant_memory(120.0, None);
        assert!(!is_archivable(&memory, 0.5, current_timestamp()));
    }

    #[test]
    fn test_recent_access_blocks_archival() {
        let now = current_timestamp();
        let mut memory = dormant_memory(120.0, None);
        memory
            .metadata
            .insert("last_accessed_at".to_string(), json!(now - 10.0 * 86_400.0));
        assert!(!is_archivable(&memory, 0.05, now));
    }

    #[test]
    fn test_quality_tier_extends_retention() {
        let now = current_timestamp();
        // 120 days old: past the low tier (90 d) but inside high (365 d)
        let low_quality = dormant_memory(120.0, Some(0.2));
        let high_quality = dormant_memory(120.0, Some(0.9));
        assert!(is_archivable(&low_quality, 0.05, now));
        assert!(!is_archivable(&high_quality, 0.05, now));

        // Past a year, even high quality goes
        let ancient_high = dormant_memory(400.0, Some(0.9));
        assert!(is_archivable(&ancient_high, 0.05, now));
    }

    #[test]
    fn test_already_archived_is_skipped() {
        let now = current_timestamp();
        let mut memory = dormant_memory(120.0, None);
        archive(&mut memory, 0.05, now);
        assert!(memory.is_archived());
        assert!(!is_archivable(&memory, 0.05, now));
        assert!(memory.metadata.contains_key("archived_at"));
    }
}
