//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`VoyageProvider`]**: calls the Voyage AI embeddings API.
//!
//! A secondary provider can be configured under `[embedding.fallback]`; it is
//! used when the primary one errors. Vectors are always stored together with
//! the model that produced them, and similarity is only ever computed between
//! vectors of the same model.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! and Voyage AI reranking via [`rerank`].
//!
//! # Retry Strategy
//!
//! Both providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::{env_secret, EmbeddingConfig};

/// Trait for embedding providers.
///
/// Carries provider metadata; the HTTP calls live in [`embed_texts`], which
/// dispatches on the configured provider name.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"voyage-3"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;
}

/// What the text is used for. Voyage embeds queries and documents
/// asymmetrically; OpenAI ignores the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Query,
    Document,
}

impl InputType {
    fn as_str(&self) -> &'static str {
        match self {
            InputType::Query => "query",
            InputType::Document => "document",
        }
    }
}

/// Vectors together with the model that produced them.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub vectors: Vec<Vec<f32>>,
    pub model: String,
}

/// Embed a batch of texts using the configured provider.
///
/// # Errors
///
/// - `"disabled"` provider: always returns an error.
/// - otherwise: the API key is missing, the API returns a non-retryable
///   error, all retries are exhausted, or a vector has the wrong length.
pub async fn embed_texts(
    config: &EmbeddingConfig,
    texts: &[String],
    input_type: InputType,
) -> Result<Vec<Vec<f32>>> {
    let vectors = match config.provider.as_str() {
        "openai" => {
            let key = api_key(config, "OPENAI_API_KEY").ok_or_else(|| anyhow!("OPENAI_API_KEY not set"))?;
            embed_openai(config, &key, texts).await?
        }
        "voyage" => {
            let key = api_key(config, "VOYAGE_API_KEY").ok_or_else(|| anyhow!("VOYAGE_API_KEY not set"))?;
            embed_voyage(config, &key, texts, input_type).await?
        }
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    };

    check_dims(config, texts.len(), &vectors)?;
    Ok(vectors)
}

/// Embed with the primary provider, falling back to `[embedding.fallback]`.
pub async fn embed_with_fallback(
    config: &EmbeddingConfig,
    texts: &[String],
    input_type: InputType,
) -> Result<Embedded> {
    match embed_texts(config, texts, input_type).await {
        Ok(vectors) => Ok(Embedded {
            vectors,
            model: model_of(config),
        }),
        Err(primary_err) => match &config.fallback {
            Some(fallback) => {
                tracing::warn!(
                    provider = %config.provider,
                    fallback = %fallback.provider,
                    error = %primary_err,
                    "primary embedding provider failed, using fallback"
                );
                let vectors = embed_texts(fallback, texts, input_type).await?;
                Ok(Embedded {
                    vectors,
                    model: model_of(fallback),
                })
            }
            None => Err(primary_err),
        },
    }
}

/// Embed a single query text, with fallback.
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<(Vec<f32>, String)> {
    let embedded = embed_with_fallback(config, &[text.to_string()], InputType::Query).await?;
    let model = embedded.model;
    embedded
        .vectors
        .into_iter()
        .next()
        .map(|v| (v, model))
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

fn model_of(config: &EmbeddingConfig) -> String {
    config.model.clone().unwrap_or_default()
}

fn check_dims(config: &EmbeddingConfig, expected_len: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected_len {
        bail!(
            "Embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_len
        );
    }
    if let Some(dims) = config.dims {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                dims,
                bad.len()
            );
        }
    }
    Ok(())
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using `POST /v1/embeddings` on the OpenAI API.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "OpenAI")?;
        if api_key(config, "OPENAI_API_KEY").is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Voyage Provider ============

/// Embedding provider using `POST /v1/embeddings` on the Voyage AI API.
/// Requires the `VOYAGE_API_KEY` environment variable to be set.
pub struct VoyageProvider {
    model: String,
    dims: usize,
}

impl VoyageProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "Voyage")?;
        if api_key(config, "VOYAGE_API_KEY").is_none() {
            bail!("VOYAGE_API_KEY environment variable not set");
        }
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for VoyageProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn api_key(config: &EmbeddingConfig, var: &str) -> Option<String> {
    config.api_key.clone().or_else(|| env_secret(var))
}

fn model_and_dims(config: &EmbeddingConfig, label: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow!("embedding.model required for {} provider", label))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow!("embedding.dims required for {} provider", label))?;
    Ok((model, dims))
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"voyage"` | [`VoyageProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "voyage" => Ok(Box::new(VoyageProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ HTTP ============

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

async fn embed_openai(config: &EmbeddingConfig, api_key: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let base = config.url.as_deref().unwrap_or("https://api.openai.com");

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let json = post_with_retry(
        &format!("{}/v1/embeddings", base.trim_end_matches('/')),
        api_key,
        &body,
        config.max_retries,
        config.timeout_secs,
        "OpenAI",
    )
    .await?;
    parse_embedding_response(json)
}

async fn embed_voyage(
    config: &EmbeddingConfig,
    api_key: &str,
    texts: &[String],
    input_type: InputType,
) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let base = config.url.as_deref().unwrap_or("https://api.voyageai.com");

    let body = serde_json::json!({
        "model": model,
        "input": texts,
        "input_type": input_type.as_str(),
    });

    let json = post_with_retry(
        &format!("{}/v1/embeddings", base.trim_end_matches('/')),
        api_key,
        &body,
        config.max_retries,
        config.timeout_secs,
        "Voyage",
    )
    .await?;
    parse_embedding_response(json)
}

/// POST a JSON body with retry/backoff.
///
/// - HTTP 429 or 5xx → retry with exponential backoff
/// - HTTP 4xx (not 429) → fail immediately
/// - Network error → retry
async fn post_with_retry(
    url: &str,
    api_key: &str,
    body: &serde_json::Value,
    max_retries: u32,
    timeout_secs: u64,
    label: &str,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;

    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                // Client error (not 429), don't retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
}

/// Extracts `data[].embedding`, ordered by `index` so output matches input.
fn parse_embedding_response(json: serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let mut parsed: EmbeddingResponse = serde_json::from_value(json)
        .map_err(|e| anyhow!("Invalid embedding response: {}", e))?;
    parsed.data.sort_by_key(|item| item.index);
    Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
}

// ============ Rerank ============

#[derive(Deserialize)]
struct RerankResponse {
    data: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f64,
}

/// Reorders `documents` by relevance to `query` with Voyage AI rerank.
///
/// Returns `(original_index, relevance_score)` pairs, best first.
pub async fn rerank(
    base_url: &str,
    model: &str,
    query: &str,
    documents: &[String],
) -> Result<Vec<(usize, f64)>> {
    let key = env_secret("VOYAGE_API_KEY").ok_or_else(|| anyhow!("VOYAGE_API_KEY not set"))?;
    rerank_with_key(base_url, &key, model, query, documents).await
}

async fn rerank_with_key(
    base_url: &str,
    api_key: &str,
    model: &str,
    query: &str,
    documents: &[String],
) -> Result<Vec<(usize, f64)>> {
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let body = serde_json::json!({
        "query": query,
        "documents": documents,
        "model": model,
    });

    let json = post_with_retry(
        &format!("{}/v1/rerank", base_url.trim_end_matches('/')),
        api_key,
        &body,
        1,
        30,
        "Voyage rerank",
    )
    .await?;

    let parsed: RerankResponse =
        serde_json::from_value(json).map_err(|e| anyhow!("Invalid rerank response: {}", e))?;
    let mut ranked: Vec<(usize, f64)> = parsed
        .data
        .into_iter()
        .filter(|item| item.index < documents.len())
        .map(|item| (item.index, item.relevance_score))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// ```rust
/// use newsdesk::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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
