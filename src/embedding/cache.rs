//! LRU caching wrapper around any embedder.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::Result;

const DEFAULT_CAPACITY: usize = 512;

/// Caches embeddings keyed by the SHA-256 of the input text.
///
/// Embedders are deterministic within a process lifetime, so a hit is
/// always valid. Misses fall through to the inner embedder in one batch.
pub struct CachingEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachingEmbedder<E> {
    /// Wraps `inner` with the default cache capacity.
    #[must_use]
    pub fn new(inner: E) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    /// Wraps `inner` with an explicit capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.lock() {
            Ok(mut cache) => cache.get(key).cloned(),
            Err(poisoned) => {
                tracing::warn!("embedding cache mutex was poisoned, recovering");
                poisoned.into_inner().get(key).cloned()
            },
        }
    }

    fn insert(&self, key: String, vector: Vec<f32>) {
        match self.cache.lock() {
            Ok(mut cache) => {
                cache.put(key, vector);
            },
            Err(poisoned) => {
                poisoned.into_inner().put(key, vector);
            },
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachingEmbedder<E> {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn max_input_chars(&self) -> Option<usize> {
        self.inner.max_input_chars()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| Self::cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> =
            keys.iter().map(|k| self.lookup(k)).collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !missing.is_empty() {
            let inputs: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.inner.embed_batch(&inputs).await?;
            metrics::counter!("embedding_cache_miss_total").increment(missing.len() as u64);
            for (&i, vector) in missing.iter().zip(fresh) {
                self.insert(keys[i].clone(), vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: HashedEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner() {
        let embedder = CachingEmbedder::new(CountingEmbedder {
            inner: HashedEmbedder::new(),
            calls: AtomicUsize::new(0),
        });

        let text = vec!["repeated query".to_string()];
        let first = embedder.embed_batch(&text).await.unwrap();
        let second = embedder.embed_batch(&text).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(embedder.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_miss_fills_only_gaps() {
        let embedder = CachingEmbedder::new(CountingEmbedder {
            inner: HashedEmbedder::new(),
            calls: AtomicUsize::new(0),
        });

        embedder
            .embed_batch(&["alpha".to_string()])
            .await
            .unwrap();
        let batch = embedder
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        // alpha was cached; only beta hit the inner embedder on round two
        assert_eq!(embedder.inner.calls.load(Ordering::SeqCst), 2);
    }
}
