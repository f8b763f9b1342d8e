//! Quality scoring surface.
//!
//! Scoring is pluggable: the shipped provider derives an implicit score
//! from usage signals; AI-backed providers are opt-in externally. Scores
//! live in `metadata.quality_*`, feed consolidation's retention tiers,
//! and can optionally re-rank search results.

pub mod codec;

use serde_json::{Value, json};

use crate::Result;
use crate::models::Memory;
use crate::{Error, current_timestamp};

/// Default weight of the quality term in composite search scoring.
pub const DEFAULT_QUALITY_WEIGHT: f32 = 0.3;

/// Quality history entries kept per memory.
pub const HISTORY_CAP: usize = 3;

/// A computed quality assessment.
#[derive(Debug, Clone)]
pub struct QualityScore {
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f64,
    /// Provider name (`implicit`, `local_onnx`, `external`, `none`).
    pub provider: &'static str,
}

/// Trait for quality providers.
pub trait QualityProvider: Send + Sync {
    /// Provider name recorded in metadata.
    fn name(&self) -> &'static str;

    /// Scores a memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider's model or service is unavailable.
    fn score(&self, memory: &Memory) -> Result<QualityScore>;
}

/// Implicit-signal scoring.
///
/// For technical corpora, usage signals (access frequency, recency,
/// curation effort visible as tags and types) track usefulness better
/// than content-model scoring; this provider needs no model and is the
/// default.
pub struct ImplicitQualityProvider;

impl ImplicitQualityProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for ImplicitQualityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityProvider for ImplicitQualityProvider {
    fn name(&self) -> &'static str {
        "implicit"
    }

    fn score(&self, memory: &Memory) -> Result<QualityScore> {
        if memory.content.trim().is_empty() {
            return Err(Error::Validation(
                "cannot score empty content".to_string(),
            ));
        }

        // Curation effort: tags and an explicit type are deliberate acts.
        let tag_signal = (memory.tags.len() as f64 / 5.0).min(1.0) * 0.25;
        let type_signal = if memory.memory_type.is_some() { 0.1 } else { 0.0 };

        // Substance: very short notes rarely carry lasting value.
        let length = memory.content.chars().count() as f64;
        let length_signal = (length / 400.0).min(1.0) * 0.25;

        // Usage: repeated access is the strongest implicit endorsement.
        let access_count = memory.metadata_u64("access_count").unwrap_or(0) as f64;
        let access_signal = (access_count / 10.0).min(1.0) * 0.3;

        let recency_signal = memory.metadata_f64("last_accessed_at").map_or(0.0, |last| {
            let age_days = (current_timestamp() - last) / 86_400.0;
            if age_days < 7.0 { 0.1 } else { 0.0 }
        });

        let score =
            (tag_signal + type_signal + length_signal + access_signal + recency_signal).min(1.0);
        // Confidence grows with observed usage; a fresh memory's score is
        // mostly a guess.
        let confidence = (0.3 + access_count / 20.0).min(0.9);

        Ok(QualityScore {
            score,
            confidence,
            provider: self.name(),
        })
    }
}

/// Retention days granted by a quality score.
///
/// High-quality (`>= 0.7`) memories are retained a year by default,
/// medium (`0.5..0.7`) half that, low the standard 90 days. The
/// consolidation engine consults this before archiving.
#[must_use]
pub fn retention_days(quality_score: f64) -> u32 {
    if quality_score >= 0.7 {
        365
    } else if quality_score >= 0.5 {
        180
    } else {
        90
    }
}

/// Records a fresh assessment into a memory's metadata.
///
/// The previous score (when present) is pushed onto a history capped at
/// [`HISTORY_CAP`] entries, oldest dropped first.
pub fn record_quality(memory: &mut Memory, assessment: &QualityScore) {
    if let Some(previous) = memory.metadata_f64("quality_score") {
        let provider = memory
            .metadata
            .get("quality_provider")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_string();
        let mut history = memory
            .metadata
            .get("quality_history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        history.push(json!({"score": previous, "provider": provider}));
        while history.len() > HISTORY_CAP {
            history.remove(0);
        }
        memory
            .metadata
            .insert("quality_history".to_string(), Value::Array(history));
    }

    memory
        .metadata
        .insert("quality_score".to_string(), json!(assessment.score));
    memory
        .metadata
        .insert("quality_provider".to_string(), json!(assessment.provider));
    memory
        .metadata
        .insert("quality_confidence".to_string(), json!(assessment.confidence));
    memory.metadata.insert(
        "quality_calculated_at".to_string(),
        json!(current_timestamp()),
    );
}

/// Composite score used by opt-in quality-boosted search:
/// `(1 - w) * semantic + w * quality`.
#[must_use]
pub fn composite_score(semantic: f32, quality: f32, weight: f32) -> f32 {
    let w = weight.clamp(0.0, 1.0);
    (1.0 - w).mul_add(semantic, w * quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn memory_with(content: &str, tags: &[&str], access_count: u64) -> Memory {
        let mut memory = Memory::new(
            content,
            "ab".repeat(32),
            tags.iter().map(ToString::to_string).collect(),
            Some("note".to_string()),
            Map::new(),
        );
        memory
            .metadata
            .insert("access_count".to_string(), json!(access_count));
        memory
    }

    #[test]
    fn test_implicit_score_bounds() {
        let provider = ImplicitQualityProvider::new();
        let heavy = memory_with(&"x".repeat(1_000), &["a", "b", "c", "d", "e", "f"], 50);
        let score = provider.score(&heavy).unwrap();
        assert!(score.score <= 1.0);
        assert!(score.score >= 0.8);

        let light = memory_with("ok", &[], 0);
        let score = provider.score(&light).unwrap();
        assert!(score.score < 0.3);
    }

    #[test]
    fn test_empty_content_rejected() {
        let provider = ImplicitQualityProvider::new();
        let memory = memory_with("   ", &[], 0);
        assert!(provider.score(&memory).is_err());
    }

    #[test]
    fn test_retention_tiers() {
        assert_eq!(retention_days(0.9), 365);
        assert_eq!(retention_days(0.7), 365);
        assert_eq!(retention_days(0.6), 180);
        assert_eq!(retention_days(0.49), 90);
    }

    #[test]
    fn test_record_quality_keeps_capped_history() {
        let mut memory = memory_with("content", &[], 0);
        for i in 0..5 {
            let assessment = QualityScore {
                score: f64::from(i) / 10.0,
                confidence: 0.5,
                provider: "implicit",
            };
            record_quality(&mut memory, &assessment);
        }

        let history = memory.metadata["quality_history"].as_array().unwrap();
        assert_eq!(history.len(), HISTORY_CAP);
        // Latest score is inline, not in history
        assert!((memory.metadata_f64("quality_score").unwrap() - 0.4).abs() < 1e-9);
        assert!((history[2]["score"].as_f64().unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_default_weight() {
        let composite = composite_score(0.8, 0.4, DEFAULT_QUALITY_WEIGHT);
        assert!((composite - (0.7 * 0.8 + 0.3 * 0.4)).abs() < 1e-6);
        // Weight zero means pure semantic
        assert!((composite_score(0.8, 0.1, 0.0) - 0.8).abs() < 1e-6);
    }
}
