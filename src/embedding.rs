//! Embedding providers and vector utilities.
//!
//! The embedding model is an external collaborator: anything implementing
//! [`Embedder`] can feed chunk vectors into a project store and embed search
//! queries. Two providers ship with the crate:
//!
//! - **[`HashEmbedder`]**: deterministic feature hashing over identifier-like
//!   tokens. No model download; useful for tests and offline setups.
//! - **`LocalEmbedder`**: fastembed models run in-process (feature
//!   `local-embeddings`).
//!
//! Every vector written to a store is tagged with [`Embedder::model_id`] so
//! rows produced by a retired model can be excluded from search and
//! re-embedded.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provenance tag stored next to every vector this embedder produces.
    fn model_id(&self) -> &str;

    fn dims(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| Error::Embedding("provider returned no vector".to_string()))
    }
}

/// Build the embedder selected by `[embedding].provider`.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config.model.as_deref())?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(Error::Validation(
            "the local embedding provider requires --features local-embeddings".to_string(),
        )),
        other => Err(Error::Validation(format!(
            "unknown embedding provider: '{}'",
            other
        ))),
    }
}

// ============ Hash Provider ============

/// Feature-hashing embedder: each lowercase token is hashed (FNV-1a) into one
/// of `dims` buckets with a sign bit, and the result is L2-normalized.
pub struct HashEmbedder {
    dims: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model_id: format!("hash-{}", dims),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Splits on non-alphanumerics and on lower→upper camel-case boundaries.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.extend(ch.to_lowercase());
        } else {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_id: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(model_name: Option<&str>) -> Result<Self> {
        let name = model_name.unwrap_or("all-minilm-l6-v2");
        let (model, dims) = match name {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => {
                return Err(Error::Validation(format!(
                    "unknown local embedding model: '{}'. Supported models: \
                     all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                    other
                )))
            }
        };
        let embedding = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(true),
        )
        .map_err(|e| Error::Embedding(format!("failed to initialize local model: {}", e)))?;

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(embedding)),
            model_id: format!("fastembed:{}", name),
            dims,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
            model
                .embed(texts, None)
                .map_err(|e| Error::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| Error::Embedding(e.to_string()))?
    }
}

// ============ Vector Utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_tokenize_splits_camel_case() {
        assert_eq!(
            tokenize("parseHTTPRequest(req_body)"),
            vec!["parse", "httprequest", "req", "body"]
        );
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.model_id(), "hash-64");
        let a = e.embed_one("fn multiply(a, b)").await.unwrap();
        let b = e.embed_one("fn multiply(a, b)").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_ranks_shared_tokens_higher() {
        let e = HashEmbedder::new(256);
        let q = e.embed_one("multiply numbers").await.unwrap();
        let hit = e.embed_one("func Multiply(a, b int) int { return a * b } // numbers").await.unwrap();
        let miss = e.embed_one("render the settings panel").await.unwrap();
        assert!(cosine_similarity(&q, &hit) > cosine_similarity(&q, &miss));
    }
}
