//! HTTP completion providers for the response synthesizer.
//!
//! Dispatch is by `completion.provider`, the same way embedding providers
//! are chosen. Each call runs under `completion.timeout_secs`, which covers
//! the whole exchange including reading the response body. A timeout or a
//! non-2xx status is returned as an error, which the synthesizer maps to an
//! upstream failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use docgraph_core::models::TokenUsage;
use docgraph_core::synthesize::{Completion, CompletionRequest, CompletionService};

use crate::config::CompletionConfig;

const GEMINI_URL: &str = "https://generativelanguage.googleapis.com";
const OPENAI_URL: &str = "https://api.openai.com";

/// Sampling settings shared by the HTTP providers.
#[derive(Debug, Clone)]
struct Generation {
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    timeout: Duration,
}

impl Generation {
    fn from_config(config: &CompletionConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            anyhow!(
                "completion.model required for provider '{}'",
                config.provider
            )
        })?;
        Ok(Self {
            model,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn model_for<'a>(&'a self, request: &'a CompletionRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.model)
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// POST `body` and decode the JSON reply, all within `timeout`.
async fn post_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
    timeout: Duration,
    service: &str,
) -> Result<serde_json::Value> {
    let exchange = async {
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
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| anyhow!("{} response unreadable: {}", service, e))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => bail!("{} request timed out after {:?}", service, timeout),
    }
}

// ============ Disabled ============

/// Used when `completion.provider = "disabled"`. Every call fails.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionService for DisabledCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        bail!("Completion provider is disabled. Set [completion] provider in config.")
    }
}

// ============ Gemini ============

/// Calls `POST /v1beta/models/{model}:generateContent`.
pub struct GeminiCompletion {
    generation: Generation,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            generation: Generation::from_config(config)?,
            url: config.url.clone().unwrap_or_else(|| GEMINI_URL.to_string()),
            api_key,
            client: http_client(Duration::from_secs(config.timeout_secs))?,
        })
    }
}

#[async_trait]
impl CompletionService for GeminiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let model = self.generation.model_for(request);
        let body = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.user_prompt() }] }],
            "generationConfig": {
                "temperature": self.generation.temperature,
                "maxOutputTokens": self.generation.max_output_tokens,
            },
        });
        let http = self
            .client
            .post(format!("{}/v1beta/models/{}:generateContent", self.url, model))
            .header("x-goog-api-key", &self.api_key);
        let json = post_json(http, &body, self.generation.timeout, "Gemini").await?;
        parse_gemini_completion(&json)
    }
}

fn parse_gemini_completion(json: &serde_json::Value) -> Result<Completion> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Invalid Gemini response: missing candidates[0].content.parts"))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    let usage = json.get("usageMetadata").map(|u| {
        let prompt = u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
        let completion = u
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = u
            .get("totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(prompt + completion);
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }
    });

    Ok(Completion { text, usage })
}

// ============ OpenAI ============

/// Calls `POST /v1/chat/completions`.
pub struct OpenAICompletion {
    generation: Generation,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            generation: Generation::from_config(config)?,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
            client: http_client(Duration::from_secs(config.timeout_secs))?,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAICompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.generation.model_for(request),
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt() },
            ],
            "temperature": self.generation.temperature,
            "max_tokens": self.generation.max_output_tokens,
        });
        let http = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json(http, &body, self.generation.timeout, "OpenAI").await?;
        parse_openai_completion(&json)
    }
}

fn parse_openai_completion(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))?
        .to_string();

    let usage = json.get("usage").map(|u| {
        let field = |name: &str| u.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        TokenUsage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        }
    });

    Ok(Completion { text, usage })
}

/// Create the [`CompletionService`] named by `completion.provider`.
pub fn create_completion(config: &CompletionConfig) -> Result<Arc<dyn CompletionService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "gemini" => Ok(Arc::new(GeminiCompletion::new(config)?)),
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_parts_are_joined() {
        let json = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "Refunds " }, { "text": "take 30 days [1]." }] } }],
            "usageMetadata": { "promptTokenCount": 812, "candidatesTokenCount": 9, "totalTokenCount": 821 }
        });
        let c = parse_gemini_completion(&json).unwrap();
        assert_eq!(c.text, "Refunds take 30 days [1].");
        let usage = c.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 812);
        assert_eq!(usage.total_tokens, 821);
    }

    #[test]
    fn openai_without_usage() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "ok" } }]
        });
        let c = parse_openai_completion(&json).unwrap();
        assert_eq!(c.text, "ok");
        assert!(c.usage.is_none());
    }

    #[test]
    fn malformed_responses_rejected() {
        assert!(parse_gemini_completion(&serde_json::json!({ "candidates": [] })).is_err());
        assert!(parse_openai_completion(&serde_json::json!({ "choices": [] })).is_err());
    }

    #[tokio::test]
    async fn disabled_always_fails() {
        let request = CompletionRequest {
            system_prompt: "s".into(),
            context: "c".into(),
            query: "q".into(),
            model: None,
        };
        assert!(DisabledCompletion.complete(&request).await.is_err());
    }

    /// Serve one connection that sends headers and part of the body, then
    /// goes quiet.
    async fn stalling_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n{\"choices\":",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn stalled_response_body_times_out() {
        let url = stalling_server().await;
        let request = reqwest::Client::new().post(format!("{}/v1/chat/completions", url));
        let started = std::time::Instant::now();
        let err = post_json(
            request,
            &serde_json::json!({ "model": "m" }),
            Duration::from_millis(200),
            "OpenAI",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
