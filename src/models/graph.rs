//! Memory graph types: typed associations between content hashes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relationship carried by a directed association edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    /// Source brought about the target.
    Causes,
    /// Source resolves a problem described by the target.
    Fixes,
    /// Source and target disagree.
    Contradicts,
    /// Source provides evidence for the target.
    Supports,
    /// Source happened after the target.
    Follows,
    /// Generic semantic relatedness.
    Related,
}

impl RelationshipType {
    /// Canonical lowercase name, as stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Causes => "causes",
            Self::Fixes => "fixes",
            Self::Contradicts => "contradicts",
            Self::Supports => "supports",
            Self::Follows => "follows",
            Self::Related => "related",
        }
    }

    /// Parses a stored name. Unknown names map to `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "causes" => Some(Self::Causes),
            "fixes" => Some(Self::Fixes),
            "contradicts" => Some(Self::Contradicts),
            "supports" => Some(Self::Supports),
            "follows" => Some(Self::Follows),
            "related" => Some(Self::Related),
            _ => None,
        }
    }

    /// Symmetric types are persisted as two directed edges; asymmetric
    /// types as one.
    #[must_use]
    pub const fn is_symmetric(self) -> bool {
        matches!(self, Self::Related | Self::Contradicts)
    }
}

/// A directed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    /// Content hash of the edge source.
    pub source_hash: String,
    /// Content hash of the edge target.
    pub target_hash: String,
    /// Edge semantics.
    pub relationship_type: RelationshipType,
    /// Cosine similarity between the two memories, in `[0, 1]`.
    pub similarity: f32,
    /// Discovery context (heuristic scores, consolidation run id, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Association {
    /// Creates an edge with empty metadata.
    #[must_use]
    pub fn new(
        source_hash: impl Into<String>,
        target_hash: impl Into<String>,
        relationship_type: RelationshipType,
        similarity: f32,
    ) -> Self {
        Self {
            source_hash: source_hash.into(),
            target_hash: target_hash.into(),
            relationship_type,
            similarity: similarity.clamp(0.0, 1.0),
            metadata: Map::new(),
        }
    }

    /// The same edge with source and target swapped.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            source_hash: self.target_hash.clone(),
            target_hash: self.source_hash.clone(),
            relationship_type: self.relationship_type,
            similarity: self.similarity,
            metadata: self.metadata.clone(),
        }
    }
}

/// Traversal direction for graph queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges from source to target only.
    Outgoing,
    /// Follow edges from target to source only.
    Incoming,
    /// Follow edges both ways.
    #[default]
    Both,
}

/// A path between two memories found by shortest-path search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPath {
    /// Hashes along the path, endpoints included.
    pub hashes: Vec<String>,
    /// Number of edges traversed (`hashes.len() - 1`).
    pub length: usize,
}

/// A bounded neighborhood around a memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    /// Hashes reachable within the requested radius, root included.
    pub nodes: Vec<String>,
    /// Edges between the collected nodes.
    pub edges: Vec<Association>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_round_trip() {
        for rel in [
            RelationshipType::Causes,
            RelationshipType::Fixes,
            RelationshipType::Contradicts,
            RelationshipType::Supports,
            RelationshipType::Follows,
            RelationshipType::Related,
        ] {
            assert_eq!(RelationshipType::parse(rel.as_str()), Some(rel));
        }
        assert_eq!(RelationshipType::parse("rivals"), None);
    }

    #[test]
    fn test_symmetry() {
        assert!(RelationshipType::Related.is_symmetric());
        assert!(RelationshipType::Contradicts.is_symmetric());
        assert!(!RelationshipType::Causes.is_symmetric());
        assert!(!RelationshipType::Follows.is_symmetric());
    }

    #[test]
    fn test_similarity_clamped() {
        let a = Association::new("a", "b", RelationshipType::Related, 1.7);
        assert!((a.similarity - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reversed_swaps_endpoints() {
        let a = Association::new("a", "b", RelationshipType::Related, 0.5);
        let r = a.reversed();
        assert_eq!(r.source_hash, "b");
        assert_eq!(r.target_hash, "a");
    }
}
