//! Statistical compression of semantic clusters.
//!
//! Each DBSCAN cluster is condensed into one synthetic memory: a short
//! summary of the recurring themes, the time span covered, and the
//! member count, with every source hash linked in metadata. Source
//! memories are never deleted — the compressed record is an index card,
//! not a replacement.

use std::collections::HashMap;

use serde_json::{Map, json};

use crate::models::Memory;
use crate::services::content_hash;

/// Tag carried by every compressed cluster memory.
pub const CLUSTER_TAG: &str = "compressed_cluster";

const STOPWORDS: [&str; 24] = [
    "the", "a", "an", "and", "or", "of", "to", "in", "for", "on", "with", "is", "are", "was",
    "were", "this", "that", "it", "as", "at", "by", "from", "be", "not",
];

/// Most frequent non-stopword terms across the cluster.
fn thematic_concepts(memories: &[&Memory], top_n: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for memory in memories {
        for tag in &memory.tags {
            *counts.entry(tag.clone()).or_default() += 2;
        }
        for word in memory.content.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if word.len() < 3 || STOPWORDS.contains(&word) {
                continue;
            }
            *counts.entry(word.to_string()).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(top_n).map(|(term, _)| term).collect()
}

/// Builds the compressed cluster memory for a set of members.
///
/// Returns `None` for clusters of fewer than two members — nothing to
/// compress.
#[must_use]
pub fn compress_cluster(members: &[&Memory]) -> Option<Memory> {
    if members.len() < 2 {
        return None;
    }

    let oldest = members
        .iter()
        .map(|m| m.created_at)
        .fold(f64::INFINITY, f64::min);
    let newest = members
        .iter()
        .map(|m| m.created_at)
        .fold(f64::NEG_INFINITY, f64::max);
    let span_days = (newest - oldest) / 86_400.0;

    let concepts = thematic_concepts(members, 5);
    let content = format!(
        "Cluster summary: {} memories spanning {:.1} days. Recurring themes: {}.",
        members.len(),
        span_days,
        concepts.join(", "),
    );

    let source_hashes: Vec<&str> = members.iter().map(|m| m.content_hash.as_str()).collect();
    let mut metadata = Map::new();
    metadata.insert("source_memory_hashes".to_string(), json!(source_hashes));
    metadata.insert(
        "temporal_span".to_string(),
        json!({
            "start": oldest,
            "end": newest,
            "span_days": span_days,
        }),
    );
    metadata.insert("cluster_size".to_string(), json!(members.len()));

    let tags = vec![CLUSTER_TAG.to_string()];
    let hash = content_hash(&content, &tags, Some("summary"));
    Some(Memory::new(
        content,
        hash,
        tags,
        Some("summary".to_string()),
        metadata,
    ))
}
