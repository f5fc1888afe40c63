use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use docgraph_core::embedding::EMBEDDING_DIMS;
use docgraph_core::mode::RetrievalMode;
use docgraph_core::query::{DEFAULT_TOP_K, MAX_TOP_K};
use docgraph_core::synthesize::DEFAULT_SYSTEM_PROMPT;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub plans: BTreeMap<String, PlanConfig>,
    #[serde(default = "default_plan")]
    pub default_plan: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_plan() -> String {
    "free".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_query_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_group_pause_ms")]
    pub group_pause_ms: u64,
    /// Base URL override; each provider has its own default.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: EMBEDDING_DIMS,
            batch_size: 100,
            max_attempts: 3,
            backoff_base_ms: 1000,
            timeout_secs: 30,
            requests_per_minute: 1500,
            group_pause_ms: 1000,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    EMBEDDING_DIMS
}
fn default_batch_size() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_requests_per_minute() -> u32 {
    1500
}
fn default_group_pause_ms() -> u64 {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            timeout_secs: 60,
            temperature: 0.2,
            max_output_tokens: 1024,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            url: None,
        }
    }
}

fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Entities fetched by local/hybrid/mix; unset means the request's `top_k`.
    #[serde(default)]
    pub entity_top_k: Option<usize>,
    #[serde(default)]
    pub relation_top_k: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: MAX_TOP_K,
            max_context_tokens: 4000,
            entity_top_k: None,
            relation_top_k: None,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
fn default_max_top_k() -> usize {
    MAX_TOP_K
}
fn default_max_context_tokens() -> usize {
    4000
}

/// A subscription tier: which modes it unlocks and its monthly allowance.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PlanConfig {
    #[serde(default)]
    pub modes: Vec<String>,
    /// `None` means unlimited.
    #[serde(default)]
    pub monthly_queries: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.query_timeout_secs == 0 {
        anyhow::bail!("db.query_timeout_secs must be > 0");
    }

    // Validate retrieval
    let r = &config.retrieval;
    if r.max_top_k < 1 || r.max_top_k > MAX_TOP_K {
        anyhow::bail!("retrieval.max_top_k must be in [1, {}]", MAX_TOP_K);
    }
    if r.default_top_k < 1 || r.default_top_k > r.max_top_k {
        anyhow::bail!("retrieval.default_top_k must be in [1, retrieval.max_top_k]");
    }
    if r.max_context_tokens == 0 {
        anyhow::bail!("retrieval.max_context_tokens must be > 0");
    }
    if r.entity_top_k == Some(0) || r.relation_top_k == Some(0) {
        anyhow::bail!("retrieval.entity_top_k and retrieval.relation_top_k must be > 0");
    }

    // Validate embedding
    let e = &config.embedding;
    if e.dims != EMBEDDING_DIMS {
        anyhow::bail!(
            "embedding.dims must be {} (the stored vector width), got {}",
            EMBEDDING_DIMS,
            e.dims
        );
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if e.max_attempts == 0 {
        anyhow::bail!("embedding.max_attempts must be >= 1");
    }
    if e.requests_per_minute == 0 {
        anyhow::bail!("embedding.requests_per_minute must be > 0");
    }
    // The local provider falls back to its bundled default model.
    if e.is_enabled() && e.provider != "local" && e.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            e.provider
        );
    }
    match e.provider.as_str() {
        "disabled" | "gemini" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, gemini, openai, ollama, or local.",
            other
        ),
    }

    // Validate completion
    let c = &config.completion;
    if c.is_enabled() && c.model.is_none() {
        anyhow::bail!(
            "completion.model must be specified when provider is '{}'",
            c.provider
        );
    }
    match c.provider.as_str() {
        "disabled" | "gemini" | "openai" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled, gemini, or openai.",
            other
        ),
    }

    // Validate plans
    for (name, plan) in &config.plans {
        for mode in &plan.modes {
            mode.parse::<RetrievalMode>()
                .with_context(|| format!("plans.{}.modes", name))?;
        }
    }
    if !config.plans.is_empty() && !config.plans.contains_key(&config.default_plan) {
        anyhow::bail!(
            "default_plan '{}' is not defined under [plans]",
            config.default_plan
        );
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!("logging.format must be pretty or json, got '{}'", other),
    }

    Ok(config)
}
