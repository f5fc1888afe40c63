//! Embedding trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that the retrieval engine uses to turn a
//! query into a vector, plus pure helpers for the storage codec and for
//! similarity computation.
//!
//! Concrete clients (Gemini, OpenAI, Ollama, local fastembed) with retry,
//! batching, and rate limiting live in the `docgraph` app crate.
//!
//! # Storage format
//!
//! Vectors are stored as a bracketed, comma-separated list of numbers:
//!
//! ```text
//! [0.25,-1.5,3]
//! ```
//!
//! Components are written with Rust's shortest round-trip float formatting,
//! so [`deserialize_vector`] reconstructs exactly the same `f32` sequence.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::error::EmbeddingFailed;

/// Dimensionality of every stored embedding vector.
pub const EMBEDDING_DIMS: usize = 768;

/// Anything that can embed a single text.
///
/// Implementations own their retry policy; an `Err` means every attempt
/// has already been used.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingFailed>;
}

/// Reject vectors that are not exactly [`EMBEDDING_DIMS`] long.
pub fn check_dims(vector: &[f32]) -> Result<()> {
    if vector.len() != EMBEDDING_DIMS {
        bail!(
            "embedding has {} dimensions, expected {}",
            vector.len(),
            EMBEDDING_DIMS
        );
    }
    Ok(())
}

/// Encode a vector in the canonical `[a,b,c]` text form.
///
/// # Example
///
/// ```rust
/// use docgraph_core::embedding::{deserialize_vector, serialize_vector};
///
/// let v = vec![1.0f32, -2.5, 0.1];
/// let s = serialize_vector(&v);
/// assert_eq!(s, "[1,-2.5,0.1]");
/// assert_eq!(deserialize_vector(&s).unwrap(), v);
/// ```
pub fn serialize_vector(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 12 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Decode the `[a,b,c]` text form produced by [`serialize_vector`].
///
/// Whitespace around components is tolerated. `"[]"` decodes to an empty
/// vector.
pub fn deserialize_vector(text: &str) -> Result<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .with_context(|| format!("vector is not bracketed: {:.40}", text))?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .enumerate()
        .map(|(i, part)| {
            part.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid vector component {}: {:?}", i, part))
        })
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance, `1 - cos(a, b)`, in `[0.0, 2.0]`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Rank `items` by distance to `query`, keeping the first `k`.
///
/// The sort is stable, so items at equal distance keep their input order.
/// Stores pass rows in insertion order to get oldest-first tie breaking.
pub fn rank_by_distance<T>(
    query: &[f32],
    items: impl IntoIterator<Item = (T, Vec<f32>)>,
    k: usize,
) -> Vec<(T, f32)> {
    let mut scored: Vec<(T, f32)> = items
        .into_iter()
        .map(|(item, vector)| {
            let d = cosine_distance(query, &vector);
            (item, d)
        })
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001, f32::MIN_POSITIVE, 1e-30, 0.1 + 0.2];
        let text = serialize_vector(&vec);
        let restored = deserialize_vector(&text).unwrap();
        assert_eq!(vec.len(), restored.len());
        for (a, b) in vec.iter().zip(restored.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_vector_roundtrip_full_dims() {
        let vec: Vec<f32> = (0..EMBEDDING_DIMS).map(|i| (i as f32).sin() / 7.0).collect();
        let restored = deserialize_vector(&serialize_vector(&vec)).unwrap();
        assert_eq!(vec, restored);
        assert!(check_dims(&restored).is_ok());
    }

    #[test]
    fn test_deserialize_tolerates_whitespace() {
        let v = deserialize_vector(" [ 1 , 2.5,-3 ] ").unwrap();
        assert_eq!(v, vec![1.0, 2.5, -3.0]);
    }

    #[test]
    fn test_deserialize_empty() {
        assert!(deserialize_vector("[]").unwrap().is_empty());
        assert_eq!(serialize_vector(&[]), "[]");
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(deserialize_vector("1,2,3").is_err());
        assert!(deserialize_vector("[1,abc]").is_err());
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims(&vec![0.0; EMBEDDING_DIMS]).is_ok());
        assert!(check_dims(&vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_rank_ties_keep_input_order() {
        let q = vec![1.0, 0.0];
        let items = vec![
            ("old", vec![0.0, 1.0]),
            ("close", vec![1.0, 0.1]),
            ("new", vec![0.0, 1.0]),
        ];
        let ranked = rank_by_distance(&q, items, 3);
        let order: Vec<&str> = ranked.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec!["close", "old", "new"]);
    }
}
