//! Configuration loading.
//!
//! Settings come from a TOML file (see `config/newsdesk.example.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//! A handful of deployment settings can be overridden from the environment,
//! and API secrets are *only* read from the environment, never from the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub newsapi: NewsApiConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Chat turns are refused with 503 above this load percentage.
    #[serde(default = "default_max_load_percent")]
    pub max_load_percent: f64,
    /// Global chat turn budget per minute. `0` disables the limit.
    #[serde(default = "default_chat_rate_limit")]
    pub chat_rate_limit_per_minute: u32,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_load_percent: default_max_load_percent(),
            chat_rate_limit_per_minute: default_chat_rate_limit(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_max_load_percent() -> f64 {
    90.0
}
fn default_chat_rate_limit() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewsApiConfig {
    #[serde(default = "default_newsapi_url")]
    pub url: String,
    /// Queries sent to `/v2/everything`, one request each.
    #[serde(default = "default_newsapi_queries")]
    pub queries: Vec<String>,
    /// Categories sent to `/v2/top-headlines`, one request each.
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NewsApiConfig {
    fn default() -> Self {
        Self {
            url: default_newsapi_url(),
            queries: default_newsapi_queries(),
            categories: Vec::new(),
            language: default_language(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_newsapi_url() -> String {
    "https://newsapi.org".to_string()
}
fn default_newsapi_queries() -> Vec<String> {
    vec!["geopolitics".to_string()]
}
fn default_language() -> String {
    "en".to_string()
}
fn default_page_size() -> u32 {
    50
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaggingConfig {
    /// Tag newly inserted articles during ingestion.
    #[serde(default)]
    pub inline: bool,
    #[serde(default = "default_tagging_limit")]
    pub batch_limit: usize,
    /// Overrides the model of the first LLM provider for tagging calls.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            inline: false,
            batch_limit: default_tagging_limit(),
            model: None,
        }
    }
}

fn default_tagging_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override, mostly for self-hosted gateways and tests.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Secondary provider tried when the primary one errors.
    #[serde(default)]
    pub fallback: Option<Box<EmbeddingConfig>>,
    /// Key set in code; never read from the file. Falls back to the
    /// provider's environment variable.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            fallback: None,
            api_key: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    /// Minimum cosine similarity for a vector candidate to be kept.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    /// Voyage rerank model (e.g. `rerank-2`). Reranking is off when unset.
    #[serde(default)]
    pub rerank_model: Option<String>,
    #[serde(default = "default_voyage_url")]
    pub rerank_url: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            similarity_threshold: default_similarity_threshold(),
            final_limit: default_final_limit(),
            rerank_model: None,
            rerank_url: default_voyage_url(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    40
}
fn default_similarity_threshold() -> f32 {
    0.35
}
fn default_final_limit() -> i64 {
    8
}
pub(crate) fn default_voyage_url() -> String {
    "https://api.voyageai.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Providers in fallback order.
    #[serde(default = "default_llm_providers")]
    pub providers: Vec<LlmProviderConfig>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: default_llm_providers(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmProviderConfig {
    /// `openai`, `openrouter`, or `perplexity`.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_llm_providers() -> Vec<LlmProviderConfig> {
    vec![LlmProviderConfig {
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
        url: None,
    }]
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Number of prior messages replayed to the model.
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_message_chars: default_max_message_chars(),
            system_prompt: None,
        }
    }
}

fn default_history_limit() -> i64 {
    12
}
fn default_max_message_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_telegram_url")]
    pub telegram_url: String,
    #[serde(default = "default_true")]
    pub alert_on_ingest_failure: bool,
    #[serde(default = "default_digest_limit")]
    pub digest_limit: i64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_url: default_telegram_url(),
            alert_on_ingest_failure: true,
            digest_limit: default_digest_limit(),
        }
    }
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_true() -> bool {
    true
}
fn default_digest_limit() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_compress_after_hours")]
    pub compress_after_hours: i64,
    #[serde(default = "default_retain_days")]
    pub retain_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            compress_after_hours: default_compress_after_hours(),
            retain_days: default_retain_days(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}
fn default_compress_after_hours() -> i64 {
    24
}
fn default_retain_days() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_max_age_days() -> i64 {
    90
}

impl Config {
    /// A config with every section at its default, pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            newsapi: NewsApiConfig::default(),
            tagging: TaggingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
            notify: NotifyConfig::default(),
            backup: BackupConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Reads a secret from the environment, treating empty values as unset.
pub fn env_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(path) = env_secret("NEWSDESK_DB_PATH") {
        config.db.path = PathBuf::from(path);
    }
    if let Some(bind) = env_secret("NEWSDESK_BIND") {
        config.server.bind = bind;
    }
    if let Some(limit) = env_secret("NEWSDESK_CHAT_RATE_LIMIT") {
        config.server.chat_rate_limit_per_minute = limit
            .parse()
            .with_context(|| format!("NEWSDESK_CHAT_RATE_LIMIT is not a number: {}", limit))?;
    }
    if let Some(pct) = env_secret("NEWSDESK_MAX_LOAD_PERCENT") {
        config.server.max_load_percent = pct
            .parse()
            .with_context(|| format!("NEWSDESK_MAX_LOAD_PERCENT is not a number: {}", pct))?;
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    if config.newsapi.page_size == 0 || config.newsapi.page_size > 100 {
        bail!("newsapi.page_size must be in 1..=100");
    }

    validate_embedding(&config.embedding, "embedding")?;
    if let Some(fallback) = &config.embedding.fallback {
        if !config.embedding.is_enabled() {
            bail!("embedding.fallback requires a primary embedding provider");
        }
        if fallback.fallback.is_some() {
            bail!("embedding.fallback cannot have its own fallback");
        }
        validate_embedding(fallback, "embedding.fallback")?;
    }

    if config.llm.providers.is_empty() {
        bail!("llm.providers must list at least one provider");
    }
    for p in &config.llm.providers {
        match p.provider.as_str() {
            "openai" | "openrouter" | "perplexity" => {}
            other => bail!(
                "Unknown LLM provider: '{}'. Must be openai, openrouter, or perplexity.",
                other
            ),
        }
        if p.model.trim().is_empty() {
            bail!("llm provider '{}' needs a model", p.provider);
        }
    }

    if config.backup.compress_after_hours < 0 || config.backup.retain_days < 1 {
        bail!("backup.compress_after_hours must be >= 0 and backup.retain_days >= 1");
    }

    if config.retention.max_age_days < 1 {
        bail!("retention.max_age_days must be >= 1");
    }

    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig, section: &str) -> Result<()> {
    match embedding.provider.as_str() {
        "disabled" | "openai" | "voyage" => {}
        other => bail!(
            "Unknown embedding provider in [{}]: '{}'. Must be disabled, openai, or voyage.",
            section,
            other
        ),
    }

    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "{}.dims must be > 0 when provider is '{}'",
                section,
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "{}.model must be specified when provider is '{}'",
                section,
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            bail!("{}.batch_size must be > 0", section);
        }
    }

    Ok(())
}
