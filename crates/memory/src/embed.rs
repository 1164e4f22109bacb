//! Embedding backends: text → fixed-dimension vector.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::MemoryError;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
    fn dimensions(&self) -> usize;
}

// ── Offline fallback ─────────────────────────────────────────────────────────

/// Deterministic hash-based embedder for offline operation and tests.
///
/// Each token is hashed into a bucket of the output vector with an
/// alternating sign, then the vector is L2-normalised.  Not semantically
/// meaningful, but stable across processes, which is what restart-safety
/// tests need.
pub struct SimpleEmbedder {
    dimensions: usize,
}

impl SimpleEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }
}

/// FNV-1a, fixed here so vectors stay stable across Rust releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Embedder for SimpleEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
        {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── HTTP backends ────────────────────────────────────────────────────────────

/// Embeddings over the OpenAI-compatible `/embeddings` contract
/// (OpenAI itself, DashScope compatible mode, or any proxy speaking it).
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, MemoryError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(MemoryError::Embedding(
                "no embedding API key configured (set EMBED_API_KEY)".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let endpoint = format!("{}/embeddings", self.base_url);
        let payload = json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(format!("unreadable embedding response: {e}")))?;
        if !status.is_success() {
            return Err(MemoryError::Embedding(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let vector: Vec<f32> = body
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| {
                MemoryError::Embedding(format!("embedding missing from response: {body}"))
            })?;

        if vector.len() != self.dimensions {
            return Err(MemoryError::Embedding(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── Backend selection ────────────────────────────────────────────────────────

const OPENAI_EMBED_BASE: &str = "https://api.openai.com/v1";
const DASHSCOPE_EMBED_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Build the configured backend.  `simple` is the offline deterministic
/// fallback and needs no credentials.
pub fn embedder_from_config(
    config: &cortex_config::EmbedConfig,
) -> Result<Arc<dyn Embedder>, MemoryError> {
    let embedder: Arc<dyn Embedder> = match config.model_type.as_str() {
        "simple" => Arc::new(SimpleEmbedder::new(config.dimensions)),
        "openai" => {
            let base = if config.base_url.is_empty() {
                OPENAI_EMBED_BASE
            } else {
                &config.base_url
            };
            Arc::new(HttpEmbedder::new(
                base,
                &config.api_key,
                &config.model_name,
                config.dimensions,
            )?)
        }
        "dashscope" => {
            let base = if config.base_url.is_empty() {
                DASHSCOPE_EMBED_BASE
            } else {
                &config.base_url
            };
            Arc::new(HttpEmbedder::new(
                base,
                &config.api_key,
                &config.model_name,
                config.dimensions,
            )?)
        }
        other => {
            return Err(MemoryError::Embedding(format!(
                "unknown embedding backend: {other}"
            )));
        }
    };
    info!(backend = %config.model_type, dimensions = config.dimensions, "embedding backend ready");
    Ok(embedder)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simple_embedder_is_deterministic() {
        let embedder = SimpleEmbedder::new(64);
        let a = embedder.embed("Paris is the capital of France").await.unwrap();
        let b = embedder.embed("Paris is the capital of France").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn simple_embedder_normalises() {
        let embedder = SimpleEmbedder::new(32);
        let v = embedder.embed("hello world").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn simple_embedder_related_texts_are_closer() {
        let embedder = SimpleEmbedder::new(128);
        let a = embedder.embed("capital of France Paris").await.unwrap();
        let b = embedder.embed("the capital of France").await.unwrap();
        let c = embedder.embed("quantum entanglement decoherence").await.unwrap();
        let sim = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(a, b)| a * b).sum() };
        assert!(sim(&a, &b) > sim(&a, &c));
    }

    #[tokio::test]
    async fn empty_text_is_zero_vector() {
        let embedder = SimpleEmbedder::new(16);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn http_embedder_requires_key() {
        assert!(HttpEmbedder::new("https://api.openai.com/v1", "", "m", 1536).is_err());
    }

    #[test]
    fn backend_selection() {
        let simple = cortex_config::EmbedConfig::default();
        assert_eq!(embedder_from_config(&simple).unwrap().dimensions(), 1536);

        let mut openai = cortex_config::EmbedConfig::default();
        openai.model_type = "openai".to_string();
        openai.api_key = "sk-x".to_string();
        assert!(embedder_from_config(&openai).is_ok());

        let mut unknown = cortex_config::EmbedConfig::default();
        unknown.model_type = "word2vec".to_string();
        assert!(embedder_from_config(&unknown).is_err());
    }
}
