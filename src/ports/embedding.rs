//! Embedding provider port.
//!
//! The client memoizes per input text with a short TTL so repeated
//! resolutions of the same canonical form within a window cost one call.

use crate::error::{AppError, AppResult};
use crate::ports::EMBEDDING_TIMEOUT;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Read-through cache TTL; authoritative vectors live in the DB.
const MEMO_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

// ============================================================================
// HTTP adapter with memoization
// ============================================================================

pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    memo: Mutex<HashMap<String, (Instant, Vec<f32>)>>,
}

impl EmbeddingClient {
    pub fn new(http: reqwest::Client, base_url: String, model: String) -> Self {
        Self {
            http,
            base_url,
            model,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn memo_get(&self, text: &str) -> Option<Vec<f32>> {
        let memo = self.memo.lock();
        memo.get(text)
            .filter(|(at, _)| at.elapsed() < MEMO_TTL)
            .map(|(_, v)| v.clone())
    }

    fn memo_put(&self, text: &str, vector: Vec<f32>) {
        let mut memo = self.memo.lock();
        if memo.len() > 4096 {
            memo.clear();
        }
        memo.insert(text.to_string(), (Instant::now(), vector));
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.memo_get(t)).collect();
        let missing: Vec<String> = texts
            .iter()
            .zip(&out)
            .filter(|(_, cached)| cached.is_none())
            .map(|(t, _)| t.clone())
            .collect();

        if !missing.is_empty() {
            let resp = self
                .http
                .post(format!("{}/v1/embeddings", self.base_url))
                .timeout(EMBEDDING_TIMEOUT)
                .json(&EmbedRequest {
                    model: &self.model,
                    input: &missing,
                })
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        AppError::ProviderTransient("timeout: embedding".to_string())
                    } else {
                        AppError::ProviderTransient(format!("embedding request: {e}"))
                    }
                })?;

            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                let snippet: String = body.chars().take(400).collect();
                return Err(AppError::ProviderTransient(format!(
                    "embedding {}: {}",
                    status.as_u16(),
                    snippet
                )));
            }

            let parsed: EmbedResponse = serde_json::from_str(&body)
                .map_err(|e| AppError::ProviderTransient(format!("embedding json parse: {e}")))?;
            if parsed.data.len() != missing.len() {
                return Err(AppError::ProviderTransient(format!(
                    "embedding count mismatch: asked {}, got {}",
                    missing.len(),
                    parsed.data.len()
                )));
            }

            let mut fetched = parsed.data.into_iter().map(|d| d.embedding);
            for (text, slot) in texts.iter().zip(out.iter_mut()) {
                if slot.is_none() {
                    let v = fetched.next().expect("one vector per missing text");
                    self.memo_put(text, v.clone());
                    *slot = Some(v);
                }
            }
        }

        Ok(out.into_iter().map(|v| v.expect("filled above")).collect())
    }
}

// ============================================================================
// Deterministic fake
// ============================================================================

/// Hash-derived unit vectors: identical text always embeds identically, and
/// distinct texts are (near-)orthogonal, which is exactly what the tier-2
/// threshold tests need.
pub struct FakeEmbedding {
    dim: usize,
    calls: Mutex<u32>,
}

impl FakeEmbedding {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock()
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;
        while v.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if v.len() == self.dim {
                    break;
                }
                let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                v.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedding {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        *self.calls.lock() += 1;
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_embedding_is_deterministic_and_normalized() {
        let fake = FakeEmbedding::new(384);
        let a = fake.embed(&["starbucks".to_string()]).await.unwrap();
        let b = fake.embed(&["starbucks".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);

        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn distinct_texts_are_not_collinear() {
        let fake = FakeEmbedding::new(384);
        let vs = fake
            .embed(&["starbucks".to_string(), "amazon".to_string()])
            .await
            .unwrap();
        let dot: f32 = vs[0].iter().zip(&vs[1]).map(|(a, b)| a * b).sum();
        assert!(dot.abs() < 0.5, "dot = {dot}");
    }
}
