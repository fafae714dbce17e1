//! Embedding generation for semantic search.
//!
//! The production embedding endpoint (`text-embedding-3-small`, 1536
//! dimensions) is an external collaborator behind the [`Embedder`] trait.
//! This module ships a deterministic hash-based implementation of the same
//! trait so the whole pipeline runs without the remote client; rankings
//! are then lexical-overlap approximations rather than semantic ones.

use crate::error::{Result, StorageError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fixed embedding dimension for the default model.
pub const EMBEDDING_DIM: usize = 1536;

/// Trait for embedding generators.
///
/// Implementations must be thread-safe (`Send + Sync`) to support batch
/// embedding through rayon.
pub trait Embedder: Send + Sync {
    /// Model identifier; part of every cache key.
    fn model(&self) -> &str;

    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// The default implementation calls `embed` sequentially;
    /// implementations may override for batching.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails for any text.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Deterministic hash-based embedder.
///
/// Combines word-level hashing with character trigram hashing, normalized
/// to unit length. Reproducible across processes, which is what the
/// dedupe and cache layers need; similarity reflects lexical overlap.
pub struct HashEmbedder {
    model: String,
    dimensions: usize,
}

impl HashEmbedder {
    /// Creates an embedder reporting the given model id and dimensions.
    #[must_use]
    pub const fn new(model: String, dimensions: usize) -> Self {
        Self { model, dimensions }
    }

    /// Hashes a string to a u64 value.
    fn hash_string(s: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        hasher.finish()
    }

    /// Generates a pseudo-embedding from text.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let normalized: String = text
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c.is_whitespace() {
                    c.to_ascii_lowercase()
                } else {
                    ' '
                }
            })
            .collect();

        // Word-level hashing (primary signal)
        for word in normalized.split_whitespace() {
            let hash = Self::hash_string(word);
            let idx = (hash as usize) % self.dimensions;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = 1.0 + ((hash >> 16) & 0xFF) as f32 / 255.0;
            embedding[idx] += sign * magnitude;
        }

        // Character trigram hashing (secondary signal for fuzzy matching)
        let chars: Vec<char> = normalized.chars().collect();
        if chars.len() >= 3 {
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                let hash = Self::hash_string(&trigram);
                let idx = (hash as usize) % self.dimensions;
                let sign = if (hash >> 32) & 1 == 0 { 0.5 } else { -0.5 };
                embedding[idx] += sign;
            }
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut embedding {
                *val /= magnitude;
            }
        }

        embedding
    }
}

impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        use rayon::prelude::*;

        Ok(texts.par_iter().map(|text| self.generate(text)).collect())
    }
}

/// Computes cosine similarity between two embedding vectors.
///
/// Returns a value between -1.0 (opposite) and 1.0 (identical); 0.0 for
/// mismatched lengths or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Encodes an f32 vector as little-endian bytes for BLOB storage.
#[must_use]
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes a BLOB back into an f32 vector, validating the expected
/// dimension.
///
/// # Errors
///
/// Returns a dimension-mismatch error when the byte length disagrees with
/// `expected_dim`.
pub fn bytes_to_vector(bytes: &[u8], expected_dim: usize) -> Result<Vec<f32>> {
    if bytes.len() != expected_dim * 4 {
        return Err(StorageError::DimensionMismatch {
            expected: expected_dim,
            actual: bytes.len() / 4,
        }
        .into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Rough token estimate for the daily budget counter (~4 chars/token).
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder() -> HashEmbedder {
        HashEmbedder::new("text-embedding-3-small".to_string(), EMBEDDING_DIM)
    }

    #[test]
    fn test_deterministic() {
        let e = embedder();
        assert_eq!(e.embed("hello world").unwrap(), e.embed("hello world").unwrap());
    }

    #[test]
    fn test_dimensions() {
        let e = embedder();
        assert_eq!(e.embed("test").unwrap().len(), EMBEDDING_DIM);
        assert_eq!(e.dimensions(), EMBEDDING_DIM);
        assert_eq!(e.model(), "text-embedding-3-small");
    }

    #[test]
    fn test_normalized_to_unit_length() {
        let emb = embedder().embed("hello world").unwrap();
        let magnitude: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_text_higher_similarity() {
        let e = embedder();
        let base = e.embed("redis connection refused on startup").unwrap();
        let similar = e.embed("redis connection timeout on startup").unwrap();
        let different = e.embed("typescript generic variance rules").unwrap();

        assert!(
            cosine_similarity(&base, &similar) > cosine_similarity(&base, &different)
        );
    }

    #[test]
    fn test_empty_text_zero_vector() {
        let emb = embedder().embed("").unwrap();
        assert!(emb.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_batch_matches_single() {
        let e = embedder();
        let batch = e.embed_batch(&["alpha", "beta"]).unwrap();
        assert_eq!(batch[0], e.embed("alpha").unwrap());
        assert_eq!(batch[1], e.embed("beta").unwrap());
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_vector_bytes_roundtrip() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let bytes = vector_to_bytes(&vector);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_vector(&bytes, 3).unwrap(), vector);
    }

    #[test]
    fn test_bytes_dimension_mismatch() {
        let bytes = vector_to_bytes(&[1.0f32; 1024]);
        let err = bytes_to_vector(&bytes, 1536).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
