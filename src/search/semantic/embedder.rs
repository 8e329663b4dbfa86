//! Embedding backends
//!
//! The semantic index is generic over an [`Embedder`]: anything that can
//! turn a batch of texts into fixed-dimension vectors. Production
//! deployments plug in a model-backed implementation; the crate ships a
//! deterministic character-n-gram hashing embedder that needs no model
//! files, embeds identically on every platform, and still places words
//! sharing surface structure near each other. All embedders must return
//! L2-normalized vectors so similarity reduces to a dot product.

use async_trait::async_trait;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::super::{Result, SearchError};

/// A batch text-to-vector backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier baked into persisted semantic indexes; an index is only
    /// loadable under the model name that produced it.
    fn model_name(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts. Vectors must be L2-normalized and
    /// `dimension()` wide.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic hashing embedder over character n-grams.
pub struct HashEmbedder {
    dimension: usize,
    name: String,
}

impl HashEmbedder {
    /// Create an embedder with the given output dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            name: format!("hash-ngram-{dimension}"),
            dimension,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let padded: Vec<char> = std::iter::once('\u{2}')
            .chain(text.chars())
            .chain(std::iter::once('\u{3}'))
            .collect();

        for n in 2..=3 {
            if padded.len() < n {
                continue;
            }
            for window in padded.windows(n) {
                let gram: String = window.iter().collect();
                let digest = Sha256::digest(gram.as_bytes());
                let bucket = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"))
                    as usize
                    % self.dimension;
                let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
        }

        normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.dimension == 0 {
            return Err(SearchError::Embedding(
                "embedding dimension must be positive".to_string(),
            ));
        }
        // CPU-bound; batch across the rayon pool.
        Ok(texts.par_iter().map(|t| self.embed_one(t)).collect())
    }
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 1e-6 {
        vector.iter_mut().for_each(|x| *x /= magnitude);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embeddings_are_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["hello".to_string(), "hello".to_string(), "xenon".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors[0], vectors[1]);
        assert_ne!(vectors[0], vectors[2]);
        for v in &vectors {
            let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((mag - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn test_similar_surface_forms_are_closer() {
        let embedder = HashEmbedder::new(128);
        let texts = vec![
            "hello".to_string(),
            "hellos".to_string(),
            "xylophone".to_string(),
        ];
        let v = embedder.embed_batch(&texts).await.unwrap();

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&v[0], &v[1]) > dot(&v[0], &v[2]));
    }
}
