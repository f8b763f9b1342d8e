//! Exponential-decay relevance scoring.
//!
//! Relevance starts from a per-type exponential decay over age, gets an
//! access-recency boost, decays three times slower for high-quality
//! memories, and is clamped to `[0, 1]`. Well-connected memories earn a
//! quality boost with a full audit trail in metadata.
//!
//! All datetime math here is float UTC seconds; there are no naive
//! datetimes anywhere to mix with aware ones.

use serde_json::json;

use crate::models::Memory;

/// Per-type decay half-life style constants, expressed as the number of
/// days for relevance to fall to `1/e`.
#[derive(Debug, Clone)]
pub struct DecayProfile {
    /// `critical` memories.
    pub critical_days: f64,
    /// `reference` memories.
    pub reference_days: f64,
    /// Everything without a recognized type.
    pub standard_days: f64,
    /// `temporary` memories.
    pub temporary_days: f64,
    /// Quality at or above this decays [`Self::quality_shield_factor`]
    /// times slower.
    pub quality_shield_threshold: f64,
    /// Slowdown for shielded memories.
    pub quality_shield_factor: f64,
}

impl Default for DecayProfile {
    fn default() -> Self {
        Self {
            critical_days: 365.0,
            reference_days: 180.0,
            standard_days: 30.0,
            temporary_days: 7.0,
            quality_shield_threshold: 0.7,
            quality_shield_factor: 3.0,
        }
    }
}

impl DecayProfile {
    fn decay_days(&self, memory_type: Option<&str>) -> f64 {
        match memory_type {
            Some("critical") => self.critical_days,
            Some("reference") => self.reference_days,
            Some("temporary") => self.temporary_days,
            _ => self.standard_days,
        }
    }
}

/// Tiered access-recency bonus: recent use keeps memories relevant.
fn access_boost(memory: &Memory, now: f64) -> f64 {
    let access_count = memory.metadata_u64("access_count").unwrap_or(0);
    if access_count == 0 {
        return 0.0;
    }
    let Some(last_accessed) = memory.metadata_f64("last_accessed_at") else {
        return 0.0;
    };
    let age_days = (now - last_accessed) / 86_400.0;
    let tier = if age_days < 7.0 {
        0.15
    } else if age_days < 14.0 {
        0.10
    } else if age_days < 30.0 {
        0.05
    } else {
        0.0
    };
    // Frequency adds a little on top of recency.
    #[allow(clippy::cast_precision_loss)]
    let frequency = (access_count.min(10) as f64) * 0.01;
    tier + frequency
}

/// Computes the relevance scalar for one memory.
#[must_use]
pub fn compute_relevance(memory: &Memory, now: f64, profile: &DecayProfile) -> f64 {
    let age_days = ((now - memory.created_at) / 86_400.0).max(0.0);
    let mut decay_days = profile.decay_days(memory.memory_type.as_deref());

    let quality = memory.metadata_f64("quality_score").unwrap_or(0.0);
    if quality >= profile.quality_shield_threshold {
        decay_days *= profile.quality_shield_factor;
    }

    let relevance = (-age_days / decay_days).exp() + access_boost(memory, now);
    relevance.clamp(0.0, 1.0)
}

/// Applies the connection-count quality boost, recording the audit
/// fields. Returns `true` when a boost was applied.
///
/// The boosted score is capped at 1.0; a memory that was already
/// boosted is left alone so repeated consolidation runs do not compound
/// the multiplier.
pub fn apply_connection_boost(
    memory: &mut Memory,
    connection_count: usize,
    min_connections: usize,
    boost_factor: f64,
    now: f64,
) -> bool {
    if connection_count < min_connections {
        return false;
    }
    if memory
        .metadata
        .get("quality_boost_applied")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return false;
    }
    let Some(original) = memory.metadata_f64("quality_score") else {
        return false;
    };

    let boosted = (original * boost_factor).min(1.0);
    memory
        .metadata
        .insert("quality_score".to_string(), json!(boosted));
    memory
        .metadata
        .insert("quality_boost_applied".to_string(), json!(true));
    memory
        .metadata
        .insert("quality_boost_date".to_string(), json!(now));
    memory.metadata.insert(
        "quality_boost_reason".to_string(),
        json!(format!("{connection_count} graph connections")),
    );
    memory.metadata.insert(
        "quality_boost_connection_count".to_string(),
        json!(connection_count),
    );
    memory.metadata.insert(
        "original_quality_before_boost".to_string(),
        json!(original),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_timestamp;
    use serde_json::Map;

    fn aged_memory(memory_type: Option<&str>, age_days: f64) -> Memory {
        let mut memory = Memory::new(
            "decay subject",
            "ab".repeat(32),
            vec![],
            memory_type.map(ToString::to_string),
            Map::new(),
        );
        memory.created_at = current_timestamp() - age_days * 86_400.0;
        memory.updated_at = memory.created_at;
        memory.normalize_timestamps();
        memory
    }

    #[test]
    fn test_fresh_memory_is_fully_relevant() {
        let memory = aged_memory(None, 0.0);
        let relevance = compute_relevance(&memory, current_timestamp(), &DecayProfile::default());
        assert!(relevance > 0.99);
    }

    #[test]
    fn test_decay_rate_depends_on_type() {
        let now = current_timestamp();
        let profile = DecayProfile::default();
        let standard = compute_relevance(&aged_memory(None, 30.0), now, &profile);
        let critical = compute_relevance(&aged_memory(Some("critical"), 30.0), now, &profile);
        let temporary = compute_relevance(&aged_memory(Some("temporary"), 30.0), now, &profile);

        assert!(critical > standard);
        assert!(standard > temporary);
        // One decay constant of age lands near 1/e
        assert!((standard - (-1.0_f64).exp()).abs() < 0.05);
    }

    #[test]
    fn test_recent_access_boost_tiers() {
        let now = current_timestamp();
        let profile = DecayProfile::default();

        let mut recent = aged_memory(None, 60.0);
        recent.metadata.insert("access_count".to_string(), json!(3));
        recent
            .metadata
            .insert("last_accessed_at".to_string(), json!(now - 2.0 * 86_400.0));

        let mut stale = aged_memory(None, 60.0);
        stale.metadata.insert("access_count".to_string(), json!(3));
        stale
            .metadata
            .insert("last_accessed_at".to_string(), json!(now - 45.0 * 86_400.0));

        let boosted = compute_relevance(&recent, now, &profile);
        let flat = compute_relevance(&stale, now, &profile);
        assert!(boosted > flat + 0.1);
    }

    #[test]
    fn test_quality_shield_slows_decay() {
        let now = current_timestamp();
        let profile = DecayProfile::default();

        let plain = aged_memory(None, 45.0);
        let mut high_quality = aged_memory(None, 45.0);
        high_quality
            .metadata
            .insert("quality_score".to_string(), json!(0.85));

        assert!(
            compute_relevance(&high_quality, now, &profile)
                > compute_relevance(&plain, now, &profile)
        );
    }

    #[test]
    fn test_relevance_clamped_to_unit_interval() {
        let now = current_timestamp();
        let mut memory = aged_memory(None, 0.0);
        memory.metadata.insert("access_count".to_string(), json!(100));
        memory
            .metadata
            .insert("last_accessed_at".to_string(), json!(now));
        let relevance = compute_relevance(&memory, now, &DecayProfile::default());
        assert!(relevance <= 1.0);
    }

    #[test]
    fn test_connection_boost_audit_trail() {
        let now = current_timestamp();
        let mut memory = aged_memory(None, 10.0);
        memory
            .metadata
            .insert("quality_score".to_string(), json!(0.6));

        assert!(!apply_connection_boost(&mut memory, 3, 5, 1.2, now));
        assert!(apply_connection_boost(&mut memory, 6, 5, 1.2, now));

        assert!((memory.metadata_f64("quality_score").unwrap() - 0.72).abs() < 1e-9);
        assert_eq!(memory.metadata["quality_boost_applied"], json!(true));
        assert_eq!(memory.metadata["quality_boost_connection_count"], json!(6));
        assert!(
            (memory.metadata_f64("original_quality_before_boost").unwrap() - 0.6).abs() < 1e-9
        );

        // A second run must not compound the boost
        assert!(!apply_connection_boost(&mut memory, 6, 5, 1.2, now));
        assert!((memory.metadata_f64("quality_score").unwrap() - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_boost_caps_at_one() {
        let now = current_timestamp();
        let mut memory = aged_memory(None, 1.0);
        memory
            .metadata
            .insert("quality_score".to_string(), json!(0.95));
        apply_connection_boost(&mut memory, 10, 5, 1.2, now);
        assert!((memory.metadata_f64("quality_score").unwrap() - 1.0).abs() < 1e-9);
    }
}
