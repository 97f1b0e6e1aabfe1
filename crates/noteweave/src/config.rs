//! Configuration for the chat pipeline
//!
//! Loaded from defaults, an optional TOML file and environment overrides
//! (credentials are normally supplied through the environment).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::providers::ProviderKind;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Database and blob storage
    pub storage: StorageConfig,
    /// Chunking configuration
    pub chunking: ChunkingConfig,
    /// Embedding configuration
    pub embeddings: EmbeddingConfig,
    /// Background ingestion
    pub ingestion: IngestionConfig,
    /// Context retrieval
    pub retrieval: RetrievalConfig,
    /// Chat completion
    pub chat: ChatConfig,
    /// AI provider credentials and models
    pub providers: ProvidersConfig,
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing sections and provider fields fall back to defaults
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.providers.fill_presets();
        Ok(config)
    }

    /// Apply environment overrides using the given lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty("NOTEWEAVE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = non_empty("NOTEWEAVE_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(dir) = non_empty("NOTEWEAVE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(key);
        }
        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.providers.anthropic.api_key = Some(key);
        }
        if let Some(key) = non_empty("GOOGLE_API_KEY").or_else(|| non_empty("GEMINI_API_KEY")) {
            self.providers.google.api_key = Some(key);
        }
        if let Some(key) = non_empty("DEEPSEEK_API_KEY") {
            self.providers.deepseek.api_key = Some(key);
        }
        if let Some(key) = non_empty("OPENROUTER_API_KEY") {
            self.providers.openrouter.api_key = Some(key);
        }
        if let Some(url) = non_empty("NOTEWEAVE_LOCAL_LLM_URL") {
            self.providers.local.base_url = url;
            self.providers.local.enabled = true;
        }
    }

    /// Reject settings that would break chunking or scheduling
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(Error::Config("chunking.chunk_size must be positive".into()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.ingestion.workers == Some(0) {
            return Err(Error::Config("ingestion.workers must be positive".into()));
        }
        if self.retrieval.default_token_budget == 0 || self.retrieval.chars_per_token == 0 {
            return Err(Error::Config(
                "retrieval.default_token_budget and chars_per_token must be positive".into(),
            ));
        }
        if self.providers.priority.is_empty() {
            return Err(Error::Config("providers.priority must list at least one provider".into()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes (default: 50MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            max_upload_size: 50 * 1024 * 1024,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the database and stored uploads
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("noteweave.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("noteweave");
        Self { data_dir }
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive windows
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider that serves the embedding endpoint
    pub provider: ProviderKind,
    /// Embedding model name
    pub model: String,
    /// Expected vector dimensions (0 = accept whatever the model returns)
    pub dimensions: usize,
}

impl EmbeddingConfig {
    /// Identifier stored alongside every vector; vectors with different ids are never compared
    pub fn model_id(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
        }
    }
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
    /// Growth factor between retries
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

/// Background ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Documents processed concurrently (default: CPU count, max 4)
    pub workers: Option<usize>,
    /// Timeout for text extraction of one document
    pub extract_timeout_secs: u64,
    /// Timeout for one embedding call
    pub embed_timeout_secs: u64,
    /// Retry policy for embedding calls
    pub retry: RetryPolicy,
}

impl IngestionConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| num_cpus::get().min(4)).max(1)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: None,
            extract_timeout_secs: 120,
            embed_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// Context retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector index
    pub top_k: usize,
    /// Token budget when the caller does not give one
    pub default_token_budget: usize,
    /// Explicitly attached documents up to this size are included whole
    pub small_document_chars: usize,
    /// Characters per estimated token
    pub chars_per_token: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            default_token_budget: 2_000,
            small_document_chars: 4_000,
            chars_per_token: 4,
        }
    }
}

/// Chat completion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Upper bound on the total duration of one streamed reply
    pub stream_timeout_secs: u64,
    /// Timeout for a non-streaming completion
    pub request_timeout_secs: u64,
    /// Default sampling temperature
    pub temperature: f32,
    /// Default output token limit
    pub max_tokens: u32,
    /// System prompt placed before retrieved context
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: 180,
            request_timeout_secs: 120,
            temperature: 0.3,
            max_tokens: 2048,
            system_prompt: "You are a helpful assistant for a personal knowledge base. \
                When document context is provided, ground your answer in it and cite sources \
                as [n]. If the context does not contain the answer, say so."
                .to_string(),
        }
    }
}

/// Settings for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// API key; a provider with no key is not registered (except the local runtime)
    pub api_key: Option<String>,
    /// Register even without a key (local runtimes)
    pub enabled: bool,
    /// API base URL
    pub base_url: String,
    /// Default chat model
    pub chat_model: String,
    /// Preferred model when a turn carries images
    pub vision_model: Option<String>,
    /// Model prefixes known to accept images
    pub vision_models: Vec<String>,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            enabled: false,
            base_url: String::new(),
            chat_model: String::new(),
            vision_model: None,
            vision_models: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl ProviderSettings {
    fn preset(base_url: &str, chat_model: &str, vision_model: Option<&str>, vision: &[&str]) -> Self {
        Self {
            base_url: base_url.to_string(),
            chat_model: chat_model.to_string(),
            vision_model: vision_model.map(str::to_string),
            vision_models: vision.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Whether credentials (or an explicit opt-in) are present
    pub fn is_configured(&self) -> bool {
        self.enabled || self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Whether `model` is known to accept image input
    pub fn supports_vision(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        self.vision_models
            .iter()
            .any(|prefix| model.starts_with(&prefix.to_ascii_lowercase()))
            || self.vision_model.as_deref().is_some_and(|v| v.eq_ignore_ascii_case(&model))
    }
}

/// All provider settings plus the fallback order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Order used for default selection and fallback
    pub priority: Vec<ProviderKind>,
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub google: ProviderSettings,
    pub deepseek: ProviderSettings,
    pub openrouter: ProviderSettings,
    pub local: ProviderSettings,
}

impl ProvidersConfig {
    /// Fill fields left empty in a config file from the built-in presets
    fn fill_presets(&mut self) {
        let presets = Self::default();
        for kind in ProviderKind::ALL {
            let preset = presets.settings(kind).clone();
            let settings = self.settings_mut(kind);
            if settings.base_url.is_empty() {
                settings.base_url = preset.base_url;
            }
            if settings.chat_model.is_empty() {
                settings.chat_model = preset.chat_model;
            }
            if settings.vision_model.is_none() {
                settings.vision_model = preset.vision_model;
            }
            if settings.vision_models.is_empty() {
                settings.vision_models = preset.vision_models;
            }
        }
    }

    fn settings_mut(&mut self, kind: ProviderKind) -> &mut ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::Anthropic => &mut self.anthropic,
            ProviderKind::Google => &mut self.google,
            ProviderKind::DeepSeek => &mut self.deepseek,
            ProviderKind::OpenRouter => &mut self.openrouter,
            ProviderKind::Local => &mut self.local,
        }
    }

    pub fn settings(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Google => &self.google,
            ProviderKind::DeepSeek => &self.deepseek,
            ProviderKind::OpenRouter => &self.openrouter,
            ProviderKind::Local => &self.local,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                ProviderKind::OpenAi,
                ProviderKind::Anthropic,
                ProviderKind::Google,
                ProviderKind::DeepSeek,
                ProviderKind::OpenRouter,
                ProviderKind::Local,
            ],
            openai: ProviderSettings::preset(
                "https://api.openai.com/v1",
                "gpt-4o-mini",
                Some("gpt-4o"),
                &["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4"],
            ),
            anthropic: ProviderSettings::preset(
                "https://api.anthropic.com",
                "claude-3-5-sonnet-latest",
                Some("claude-3-5-sonnet-latest"),
                &["claude-3", "claude-sonnet", "claude-opus", "claude-haiku-4"],
            ),
            google: ProviderSettings::preset(
                "https://generativelanguage.googleapis.com/v1beta",
                "gemini-2.0-flash",
                Some("gemini-2.0-flash"),
                &["gemini"],
            ),
            deepseek: ProviderSettings::preset("https://api.deepseek.com/v1", "deepseek-chat", None, &[]),
            openrouter: ProviderSettings::preset(
                "https://openrouter.ai/api/v1",
                "openai/gpt-4o-mini",
                Some("openai/gpt-4o"),
                &["openai/gpt-4o", "anthropic/claude", "google/gemini"],
            ),
            local: ProviderSettings::preset(
                "http://localhost:11434/v1",
                "llama3.2",
                Some("llava"),
                &["llava", "llama3.2-vision", "bakllava", "moondream"],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [chunking]
            chunk_size = 500
            chunk_overlap = 50

            [providers.openai]
            api_key = "sk-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.server.port, 8080);
        assert!(config.providers.openai.is_configured());
        assert_eq!(config.providers.openai.chat_model, "gpt-4o-mini");
        assert!(!config.providers.anthropic.is_configured());
    }

    #[test]
    fn test_overlap_must_be_smaller() {
        let mut config = AppConfig::default();
        config.chunking.chunk_overlap = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "ak"),
            ("GEMINI_API_KEY", "gk"),
            ("NOTEWEAVE_PORT", "9090"),
            ("OPENAI_API_KEY", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9090);
        assert!(config.providers.anthropic.is_configured());
        assert!(config.providers.google.is_configured());
        assert!(!config.providers.openai.is_configured());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(300));
    }

    #[test]
    fn test_vision_prefixes() {
        let providers = ProvidersConfig::default();
        assert!(providers.openai.supports_vision("gpt-4o-mini"));
        assert!(!providers.openai.supports_vision("gpt-3.5-turbo"));
        assert!(!providers.deepseek.supports_vision("deepseek-chat"));
    }
}
