//! Creative association discovery.
//!
//! Pairs of memories whose cosine similarity falls in the "creative
//! band" — related enough to be meaningful, distant enough to be
//! non-obvious — become typed graph edges. The relationship type is
//! inferred from tag overlap, type labels, temporal adjacency, and
//! light content cues; `related` when nothing stronger applies.

use serde_json::json;

use crate::embedding::cosine_similarity;
use crate::models::{Association, Memory, RelationshipType};

/// Similarity band considered creative: below it pairs are unrelated,
/// above it they are near-duplicates and uninteresting as edges.
pub const CREATIVE_BAND: (f32, f32) = (0.3, 0.7);

/// Memories sampled per run; pairwise comparison is quadratic.
pub const MAX_SAMPLE: usize = 100;

fn content_has_any(content: &str, cues: &[&str]) -> bool {
    let lower = content.to_lowercase();
    cues.iter().any(|cue| lower.contains(cue))
}

/// Infers the relationship between a similar pair.
///
/// Direction matters for asymmetric types: the returned association
/// points from `a` to `b`.
#[must_use]
pub fn infer_relationship(a: &Memory, b: &Memory) -> RelationshipType {
    let fix_cues = ["fixed", "fix ", "resolve", "patch", "workaround"];
    let problem_cues = ["error", "bug", "fail", "crash", "broken"];
    if content_has_any(&a.content, &fix_cues) && content_has_any(&b.content, &problem_cues) {
        return RelationshipType::Fixes;
    }

    let negation_cues = ["not ", "never ", "instead", "rather than", "disagree"];
    if content_has_any(&a.content, &negation_cues) || content_has_any(&b.content, &negation_cues) {
        let shared_tags = a.tags.iter().any(|tag| b.tags.contains(tag));
        if shared_tags {
            return RelationshipType::Contradicts;
        }
    }

    let cause_cues = ["because", "caused", "led to", "resulted in", "due to"];
    if content_has_any(&a.content, &cause_cues) {
        return RelationshipType::Causes;
    }

    // Same-day neighbors in the same type usually form a sequence.
    let same_type = a.memory_type.is_some() && a.memory_type == b.memory_type;
    if same_type && (a.created_at - b.created_at).abs() < 86_400.0 {
        return RelationshipType::Follows;
    }

    if a.tags.iter().any(|tag| b.tags.contains(tag)) {
        return RelationshipType::Supports;
    }

    RelationshipType::Related
}

/// Finds creative associations among `memories` (only those carrying
/// embeddings participate).
#[must_use]
pub fn discover_associations(memories: &[Memory]) -> Vec<Association> {
    let sample: Vec<&Memory> = memories
        .iter()
        .filter(|m| m.embedding.is_some())
        .take(MAX_SAMPLE)
        .collect();

    let mut associations = Vec::new();
    for (i, a) in sample.iter().enumerate() {
        for b in sample.iter().skip(i + 1) {
            let (Some(va), Some(vb)) = (&a.embedding, &b.embedding) else {
                continue;
            };
            let similarity = cosine_similarity(va, vb);
            if similarity < CREATIVE_BAND.0 || similarity > CREATIVE_BAND.1 {
                continue;
            }

            let relationship_type = infer_relationship(a, b);
            let mut association = Association::new(
                a.content_hash.clone(),
                b.content_hash.clone(),
                relationship_type,
                similarity,
            );
            association
                .metadata
                .insert("discovered_by".to_string(), json!("consolidation"));
            association
                .metadata
                .insert("raw_similarity".to_string(), json!(similarity));
            associations.push(association);
        }
    }
    associations
}

/// Renders an association as a legacy "association memory" body, for
/// the `memories_only` and `dual_write` graph storage modes.
#[must_use]
pub fn association_memory_content(association: &Association) -> String {
    format!(
        "Association ({}): {} -> {} [similarity {:.2}]",
        association.relationship_type.as_str(),
        association.source_hash,
        association.target_hash,
        association.similarity,
    )
}
