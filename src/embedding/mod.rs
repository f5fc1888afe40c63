//! Embedding client and provider implementations.
//!
//! [`EmbeddingClient`] wraps an [`EmbeddingProvider`] with the retry and
//! rate-limiting policy every caller shares:
//!
//! - **Single text**: up to `max_attempts` attempts, each under its own
//!   timeout. Before attempt *n* > 1 the client waits
//!   `2^(n-2) × backoff_base` (1s, 2s, ... with the default base). A vector
//!   of the wrong width counts as a failed attempt.
//! - **Batch**: texts are processed in groups of `batch_size`. Within a
//!   group all sub-calls run concurrently; sub-call *i* starts
//!   `i × (60s / requests_per_minute)` after the group starts. Groups are
//!   separated by `group_pause`. A text that exhausts its attempts yields an
//!   empty vector at its position; the batch itself only fails when
//!   credentials are missing.
//!
//! Providers:
//! - **[`GeminiProvider`]**: `models/{model}:embedContent`, key from `GEMINI_API_KEY`.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`**: fastembed, behind the `local-embeddings` feature.
//! - **[`DisabledProvider`]**: reports missing credentials for every call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;

use docgraph_core::embedding::{check_dims, Embedder, EMBEDDING_DIMS};
use docgraph_core::error::EmbeddingFailed;

use crate::config::EmbeddingConfig;
use crate::progress::{EmbedProgressReporter, GroupProgress};

/// Batch-level failure. Per-text failures never surface here.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding credentials unavailable: {0}")]
    CredentialsUnavailable(String),
}

/// One embedding backend. Implementations make a single call with no retry.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-004"`).
    fn model_name(&self) -> &str;

    /// `Err(reason)` when the provider cannot authenticate.
    fn check_credentials(&self) -> Result<(), String> {
        Ok(())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Wait before 1-based attempt `attempt`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.backoff_base * (1u32 << (attempt - 2).min(5))
    }
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub requests_per_minute: u32,
    pub group_pause: Duration,
}

impl BatchPolicy {
    /// Offset between consecutive sub-call starts within a group.
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.requests_per_minute.max(1)))
    }
}

/// Retrying, rate-limited embedding client.
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    batch: BatchPolicy,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, retry: RetryPolicy, batch: BatchPolicy) -> Self {
        Self {
            provider,
            retry,
            batch,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider = create_provider(config)?;
        Ok(Self::new(
            provider,
            RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base: Duration::from_millis(config.backoff_base_ms),
                attempt_timeout: Duration::from_secs(config.timeout_secs),
            },
            BatchPolicy {
                batch_size: config.batch_size,
                requests_per_minute: config.requests_per_minute,
                group_pause: Duration::from_millis(config.group_pause_ms),
            },
        ))
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed one text, returning the vector and the attempt that produced it.
    pub async fn embed_with_attempts(&self, text: &str) -> Result<(Vec<f32>, u32), EmbeddingFailed> {
        if let Err(reason) = self.provider.check_credentials() {
            return Err(EmbeddingFailed {
                attempts: 0,
                message: reason,
            });
        }

        let max = self.retry.max_attempts.max(1);
        let mut last_err = String::new();

        for attempt in 1..=max {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome =
                match tokio::time::timeout(self.retry.attempt_timeout, self.provider.embed_one(text))
                    .await
                {
                    Ok(Ok(vector)) => check_dims(&vector).map(|_| vector),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(anyhow!(
                        "attempt timed out after {}ms",
                        self.retry.attempt_timeout.as_millis()
                    )),
                };

            match outcome {
                Ok(vector) => {
                    tracing::debug!(
                        model = self.provider.model_name(),
                        attempt,
                        "embedding succeeded"
                    );
                    return Ok((vector, attempt));
                }
                Err(e) => {
                    last_err = format!("{:#}", e);
                    tracing::warn!(
                        model = self.provider.model_name(),
                        attempt,
                        max_attempts = max,
                        error = %last_err,
                        "embedding attempt failed"
                    );
                }
            }
        }

        Err(EmbeddingFailed {
            attempts: max,
            message: last_err,
        })
    }

    /// Embed many texts. The output has one entry per input, in order; an
    /// empty vector marks a text that could not be embedded.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        progress: &dyn EmbedProgressReporter,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.provider
            .check_credentials()
            .map_err(EmbeddingError::CredentialsUnavailable)?;

        let batch_size = self.batch.batch_size.max(1);
        let stagger = self.batch.stagger();
        let total = texts.len();
        let groups = total.div_ceil(batch_size);
        let mut out = Vec::with_capacity(total);
        let mut done = 0usize;

        for (g, group) in texts.chunks(batch_size).enumerate() {
            if g > 0 && !self.batch.group_pause.is_zero() {
                tokio::time::sleep(self.batch.group_pause).await;
            }

            let calls = group.iter().enumerate().map(|(i, text)| async move {
                let offset = stagger * i as u32;
                if !offset.is_zero() {
                    tokio::time::sleep(offset).await;
                }
                self.embed_with_attempts(text).await
            });
            let results = join_all(calls).await;

            let mut failed = 0usize;
            for (i, result) in results.into_iter().enumerate() {
                match result {
                    Ok((vector, _)) => out.push(vector),
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(index = g * batch_size + i, error = %e, "text not embedded");
                        out.push(Vec::new());
                    }
                }
            }

            done += group.len();
            progress.report(&GroupProgress {
                group: g + 1,
                groups,
                succeeded: group.len() - failed,
                failed,
                done,
                total,
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingFailed> {
        self.embed_with_attempts(text).await.map(|(vector, _)| vector)
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn post_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
    service: &str,
) -> Result<serde_json::Value> {
    let response = request
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| anyhow!("{} connection error: {}", service, e))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("{} API error {}: {}", service, status, body_text);
    }
    Ok(response.json().await?)
}

fn floats(values: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    values
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", what))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("Invalid {} response: non-numeric component", what))
        })
        .collect()
}

// ============ Disabled Provider ============

/// Used when `embedding.provider = "disabled"`. Every call is refused.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn check_credentials(&self) -> Result<(), String> {
        Err("Embedding provider is disabled".to_string())
    }

    async fn embed_one(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Gemini Provider ============

const GEMINI_URL: &str = "https://generativelanguage.googleapis.com";

/// Calls `POST /v1beta/models/{model}:embedContent` with
/// `outputDimensionality` pinned to the stored vector width.
pub struct GeminiProvider {
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Gemini provider"))?;
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| GEMINI_URL.to_string()),
            api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn check_credentials(&self) -> Result<(), String> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err("GEMINI_API_KEY environment variable not set".to_string()),
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
            "outputDimensionality": EMBEDDING_DIMS,
        });
        let request = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:embedContent",
                self.url, self.model
            ))
            .header("x-goog-api-key", api_key);
        let json = post_json(request, &body, "Gemini").await?;
        parse_gemini_response(&json)
    }
}

fn parse_gemini_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let values = json
        .get("embedding")
        .and_then(|e| e.get("values"))
        .ok_or_else(|| anyhow!("Invalid Gemini response: missing embedding.values"))?;
    floats(values, "Gemini")
}

// ============ OpenAI Provider ============

const OPENAI_URL: &str = "https://api.openai.com";

/// Calls `POST /v1/embeddings`, requesting `dimensions = 768`.
pub struct OpenAIProvider {
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn check_credentials(&self) -> Result<(), String> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err("OPENAI_API_KEY environment variable not set".to_string()),
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": EMBEDDING_DIMS,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", api_key));
        let json = post_json(request, &body, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data[0].embedding"))?;
    floats(embedding, "OpenAI")
}

// ============ Ollama Provider ============

/// Calls `POST /api/embed` on the configured Ollama URL (default:
/// `http://localhost:11434`). The model must produce 768-dim vectors
/// (e.g. `nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            url,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        let request = self.client.post(format!("{}/api/embed", self.url));
        let json = post_json(request, &body, "Ollama")
            .await
            .map_err(|e| anyhow!("{:#} (is Ollama running at {}?)", e, self.url))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;
    floats(embedding, "Ollama")
}

// ============ Local Provider (fastembed) ============

/// Runs a 768-dim model locally via fastembed.
///
/// The model is downloaded from Hugging Face on first use and cached;
/// after that no network calls are made.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-base-en-v1.5".to_string());
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported 768-dim models: \
             bge-base-en-v1.5, nomic-embed-text-v1, nomic-embed-text-v1.5, multilingual-e5-base",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let model_name = self.model_name.clone();
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let fastembed_model = config_to_fastembed_model(&model_name)?;
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(loaded);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            let mut vectors = embedder
                .embed(vec![text], None)
                .map_err(|e| anyhow!("Local embedding failed: {}", e))?;
            vectors
                .pop()
                .ok_or_else(|| anyhow!("Local embedding returned no vector"))
        })
        .await?
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"gemini"` | [`GeminiProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
