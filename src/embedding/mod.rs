//! Embedding generation.
//!
//! Provides the injected embedding capability: a deterministic
//! hashed-projection embedder by default, an optional `fastembed`-backed
//! ONNX embedder, and an LRU caching wrapper usable around either.

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]
// Allow cast possible truncation for hash index calculations on 32-bit platforms.
#![allow(clippy::cast_possible_truncation)]

mod cache;
#[cfg(feature = "fastembed")]
mod fastembed;
mod hashed;

pub use cache::CachingEmbedder;
#[cfg(feature = "fastembed")]
pub use fastembed::FastEmbedder;
pub use hashed::HashedEmbedder;

use crate::Result;
use async_trait::async_trait;

/// Trait for embedding generators.
///
/// Implementations must be deterministic for a given text within a
/// process lifetime, so results may be cached by content hash. A failed
/// embedding surfaces as [`crate::Error::Embedding`]; it is never
/// silently replaced with a zero vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Model identifier reported by health checks and stats.
    fn model_name(&self) -> &str;

    /// Hard per-input character limit, if the model declares one.
    ///
    /// The memory service folds this into its chunking threshold; `None`
    /// defers entirely to the storage backend's content limit.
    fn max_input_chars(&self) -> Option<usize> {
        None
    }

    /// Generates embeddings for multiple texts, order preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails for any input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generates an embedding for a single text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = text.to_string();
        let mut vectors = self.embed_batch(std::slice::from_ref(&input)).await?;
        vectors.pop().ok_or_else(|| {
            crate::Error::Embedding("embedder returned an empty batch".to_string())
        })
    }
}

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Returns 0.0 when either vector has zero norm or lengths differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance in `[0, 2]` (`1 - cosine_similarity`, shifted).
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Maps a cosine distance `d ∈ [0, 2]` onto the user-visible similarity
/// score `1 - d/2`, so 1.0 is identical and 0.0 is opposite.
#[must_use]
pub fn score_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.5, -0.25, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_norm() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < f32::EPSILON);
    }

    #[test]
    fn test_score_from_distance_bounds() {
        assert!((score_from_distance(0.0) - 1.0).abs() < f32::EPSILON);
        assert!((score_from_distance(2.0)).abs() < f32::EPSILON);
        assert!((score_from_distance(1.0) - 0.5).abs() < f32::EPSILON);
        // Out-of-range distances clamp rather than produce scores outside [0, 1]
        assert!((score_from_distance(2.5)).abs() < f32::EPSILON);
    }
}
