//! Deterministic hashed-projection embedder.
//!
//! Projects token unigrams and bigrams onto a fixed-dimension unit sphere
//! using SHA-256-derived indices and signs. The result is a stable,
//! model-free embedding: identical texts always produce identical
//! vectors, overlapping texts land close in cosine space, and unrelated
//! texts scatter. Used for tests and deployments without an ONNX model.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::Result;

/// Default dimensionality, matching the all-MiniLM-L6-v2 family so the
/// local store schema is identical whichever embedder is active.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Deterministic hashed-projection embedder.
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    /// Creates an embedder with the default 384 dimensions.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    /// Creates an embedder with a custom dimensionality.
    #[must_use]
    pub const fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Hashes a token into a (bucket, sign) pair.
    fn token_slot(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let idx = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let bucket = (idx % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();

        for token in &tokens {
            let (bucket, sign) = self.token_slot(token);
            vector[bucket] += sign;
        }
        // Bigrams sharpen locality so that overlapping phrases rank above
        // bag-of-words coincidences.
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            let (bucket, sign) = self.token_slot(&bigram);
            vector[bucket] += sign * 0.5;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hashed-projection"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    fn embed(text: &str) -> Vec<f32> {
        HashedEmbedder::new().embed_one(text)
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(embed("the quick brown fox"), embed("the quick brown fox"));
    }

    #[test]
    fn test_unit_norm() {
        let v = embed("some content worth remembering");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_identical_text_scores_high() {
        let a = embed("the mitochondria is the powerhouse of the cell");
        let b = embed("the mitochondria is the powerhouse of the cell");
        assert!(cosine_similarity(&a, &b) > 0.99);
    }

    #[test]
    fn test_overlapping_text_beats_unrelated() {
        let base = embed("the mitochondria is the powerhouse of the cell");
        let near = embed("powerhouse of the cell");
        let far = embed("quarterly revenue projections for fiscal 2025");
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = embed("");
        assert!(v.iter().all(|x| x.abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let embedder = HashedEmbedder::new();
        let texts = vec!["first".to_string(), "second".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed_one("first"));
        assert_eq!(batch[1], embedder.embed_one("second"));
    }
}
