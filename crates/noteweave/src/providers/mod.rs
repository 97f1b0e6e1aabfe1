//! AI provider abstraction
//!
//! Every backend implements [`ChatProvider`]. The [`registry::ProviderRegistry`] is built
//! once from configuration and the [`selector::ModelSelector`] resolves requests against it.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod sse;
pub mod stream;
pub mod vision;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, ProviderErrorKind, Result};
use crate::types::Role;

pub use registry::ProviderRegistry;
pub use selector::{ModelSelection, ModelSelector, SelectionReason};
pub use stream::DeltaStream;

/// Supported AI backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "local")]
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::Google,
        Self::DeepSeek,
        Self::OpenRouter,
        Self::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::DeepSeek => "deepseek",
            Self::OpenRouter => "openrouter",
            Self::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "google" | "gemini" => Some(Self::Google),
            "deepseek" => Some(Self::DeepSeek),
            "openrouter" => Some(Self::OpenRouter),
            "local" | "ollama" => Some(Self::Local),
            _ => None,
        }
    }

    /// Guess which backend serves a bare model name
    pub fn infer_from_model(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        if m.contains('/') {
            Self::OpenRouter
        } else if m.starts_with("gpt-")
            || m.starts_with("chatgpt")
            || m.starts_with("o1")
            || m.starts_with("o3")
            || m.starts_with("o4")
            || m.starts_with("text-embedding-3")
        {
            Self::OpenAi
        } else if m.starts_with("claude") {
            Self::Anthropic
        } else if m.starts_with("gemini") || m.starts_with("text-embedding-004") {
            Self::Google
        } else if m.starts_with("deepseek") {
            Self::DeepSeek
        } else {
            Self::Local
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image passed inline to a vision model
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

impl InlineImage {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URL
    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (meta, data) = rest.split_once(',')?;
        let mime_type = meta.strip_suffix(";base64")?;
        if mime_type.is_empty() || data.is_empty() {
            return None;
        }
        Some(Self {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A message as sent to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub images: Vec<InlineImage>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_images(mut self, images: Vec<InlineImage>) -> Self {
        self.images = images;
        self
    }
}

/// Per-call generation options
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Overrides the provider's configured timeout; ignored for streamed calls
    pub timeout: Option<Duration>,
}

/// Capability set every AI backend implements
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model used when the caller does not name one
    fn default_model(&self) -> &str;

    /// Preferred model for turns carrying images
    fn vision_model(&self) -> Option<&str>;

    /// Whether `model` accepts image input
    fn supports_vision(&self, model: &str) -> bool;

    /// Complete a conversation and return the full reply
    async fn chat(&self, messages: &[ChatMessage], model: &str, options: &ChatOptions)
        -> Result<String>;

    /// Complete a conversation as a cancellable sequence of text deltas
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream>;

    /// Embed a text
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>>;

    /// Check if the provider is reachable and accepts our credentials
    async fn health_check(&self) -> Result<bool>;
}

/// Map a transport error from reqwest into the provider taxonomy
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        ProviderErrorKind::Unavailable
    } else if let Some(status) = err.status() {
        ProviderErrorKind::from_status(status.as_u16())
    } else {
        ProviderErrorKind::Unavailable
    };
    Error::provider(provider, kind, err.to_string())
}

/// Turn a non-success HTTP response into a classified provider error
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = ProviderErrorKind::from_status(status.as_u16());
    Err(Error::provider(
        provider,
        kind,
        format!("HTTP {} - {}", status, truncate(&body, 500)),
    ))
}

/// Classify an error reported inside a response body or stream frame
pub(crate) fn classify_error_label(label: &str) -> ProviderErrorKind {
    let label = label.to_ascii_lowercase();
    if label.contains("rate") || label.contains("quota") || label.contains("resource_exhausted") {
        ProviderErrorKind::RateLimited
    } else if label.contains("overload")
        || label.contains("unavailable")
        || label.contains("server_error")
        || label.contains("api_error")
        || label.contains("internal")
    {
        ProviderErrorKind::Unavailable
    } else if label.contains("timeout") || label.contains("deadline") {
        ProviderErrorKind::Timeout
    } else if label.contains("auth") || label.contains("permission") || label.contains("api_key") {
        ProviderErrorKind::Auth
    } else {
        ProviderErrorKind::InvalidRequest
    }
}

/// Shared client; only connecting is bounded here so streamed bodies can outlive the call timeout
pub(crate) fn build_http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(5)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Bound a whole non-streaming call; streamed replies are bounded by the chat service
pub(crate) fn with_call_timeout(
    builder: reqwest::RequestBuilder,
    options: &ChatOptions,
    default: Duration,
    stream: bool,
) -> reqwest::RequestBuilder {
    if stream {
        builder
    } else {
        builder.timeout(options.timeout.unwrap_or(default))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
