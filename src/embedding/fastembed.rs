//! FastEmbed-based embedder (feature `fastembed`).

use std::sync::Mutex;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::Embedder;
use crate::{Error, Result};

/// ONNX embedder backed by `fastembed` (all-MiniLM-L6-v2).
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedder {
    /// Default embedding dimensions for all-MiniLM-L6-v2.
    pub const DEFAULT_DIMENSIONS: usize = 384;

    /// Loads the default model, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Embedding`] if the model cannot be initialized.
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::Embedding(format!("fastembed init failed: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: "all-MiniLM-L6-v2".to_string(),
            dimensions: Self::DEFAULT_DIMENSIONS,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn max_input_chars(&self) -> Option<usize> {
        // 512-token context; conservative character budget
        Some(2_000)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<String> = texts.to_vec();
        let mut model = match self.model.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("fastembed mutex was poisoned, recovering");
                poisoned.into_inner()
            },
        };
        let vectors = model
            .embed(inputs, None)
            .map_err(|e| Error::Embedding(format!("fastembed inference failed: {e}")))?;

        for v in &vectors {
            if v.len() != self.dimensions {
                return Err(Error::Embedding(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    v.len()
                )));
            }
        }
        Ok(vectors)
    }
}
