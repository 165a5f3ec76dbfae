//! Embedding provider abstraction and the Gemini implementation.
//!
//! The [`Embedder`] trait turns text into fixed-dimension vectors. The
//! output dimensionality is fixed at construction and must match the
//! vector collection it feeds; the system uses [`EMBEDDING_DIM`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Dimensionality of every embedding in the system.
pub const EMBEDDING_DIM: u32 = 1536;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedder backed by the Gemini `embedContent` endpoint.
pub struct GeminiEmbedder {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiEmbedder {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            bail!("GOOGLE_API_KEY is not set");
        }
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{API_BASE}/models/{}:embedContent?key={}",
            self.model, self.api_key
        );
        let body = json!({
            "content": { "parts": [{ "text": text }] },
            "outputDimensionality": EMBEDDING_DIM,
        });

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| "embedding request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("embedding API error {}: {}", status, body_text);
        }

        let payload: Value = resp.json().await?;
        let values = payload
            .pointer("/embedding/values")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect::<Vec<f32>>()
            })
            .unwrap_or_default();

        if values.is_empty() {
            bail!("empty embedding returned");
        }
        Ok(values)
    }

    // Sequential fan-out; the provider's batch limits are not worth
    // tracking for the volumes involved here.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            result.push(self.embed_text(text).await?);
        }
        Ok(result)
    }
}
