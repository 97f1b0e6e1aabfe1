//! OpenAI-compatible chat adapter
//!
//! Serves OpenAI itself plus every backend that speaks the same `/chat/completions`
//! protocol: DeepSeek, the OpenRouter aggregator and local runtimes (Ollama `/v1`).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ProviderSettings;
use crate::error::{Error, ProviderErrorKind, Result};

use super::stream::{DeltaStream, FrameAction};
use super::{
    build_http_client, check_status, classify_error_label, transport_error, ChatMessage,
    ChatOptions, ChatProvider, ProviderKind, with_call_timeout,
};

/// Adapter for OpenAI-style APIs
pub struct OpenAiCompatible {
    kind: ProviderKind,
    settings: ProviderSettings,
    client: Client,
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiCompatible {
    pub fn new(kind: ProviderKind, settings: ProviderSettings) -> Result<Self> {
        let client = build_http_client(Duration::from_secs(settings.timeout_secs))?;
        Ok(Self {
            kind,
            settings,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = match self.settings.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        };
        if self.kind == ProviderKind::OpenRouter {
            builder.header("X-Title", "noteweave")
        } else {
            builder
        }
    }

    fn encode_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                if m.images.is_empty() {
                    json!({ "role": m.role.as_str(), "content": m.content })
                } else {
                    let mut parts = vec![json!({ "type": "text", "text": m.content })];
                    parts.extend(m.images.iter().map(|img| {
                        json!({ "type": "image_url", "image_url": { "url": img.data_url() } })
                    }));
                    json!({ "role": m.role.as_str(), "content": parts })
                }
            })
            .collect()
    }

    fn request(&self, messages: &[ChatMessage], model: &str, options: &ChatOptions, stream: bool) -> RequestBuilder {
        let body = CompletionRequest {
            model: model.to_string(),
            messages: Self::encode_messages(messages),
            stream,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        let builder = self.authorized(self.client.post(self.url("chat/completions")).json(&body));
        with_call_timeout(builder, options, self.call_timeout(), stream)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }
}

/// Interpret one `data:` frame of a streamed completion
pub(crate) fn parse_stream_frame(provider: &str, data: &str) -> FrameAction {
    if data.trim() == "[DONE]" {
        return FrameAction::Done;
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(_) => return FrameAction::Skip,
    };

    if let Some(err) = chunk.error {
        let label = err
            .error_type
            .or_else(|| err.code.map(|c| c.to_string()))
            .unwrap_or_else(|| err.message.clone());
        let kind = classify_error_label(&label);
        return FrameAction::Error(Error::provider(provider, kind, err.message));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return FrameAction::Skip;
    };
    match choice.delta.content {
        Some(text) if !text.is_empty() => FrameAction::Delta(text),
        _ => FrameAction::Skip,
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn default_model(&self) -> &str {
        &self.settings.chat_model
    }

    fn vision_model(&self) -> Option<&str> {
        self.settings.vision_model.as_deref()
    }

    fn supports_vision(&self, model: &str) -> bool {
        self.settings.supports_vision(model)
    }

    async fn chat(&self, messages: &[ChatMessage], model: &str, options: &ChatOptions) -> Result<String> {
        tracing::info!("Chat completion via {} ({})", self.name(), model);

        let response = self
            .request(messages, model, options, false)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                Error::provider(self.name(), ProviderErrorKind::InvalidRequest, "response had no choices")
            })
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream> {
        tracing::info!("Streaming completion via {} ({})", self.name(), model);

        let response = self
            .request(messages, model, options, true)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let provider = self.name().to_string();
        let frame_provider = provider.clone();
        Ok(DeltaStream::from_sse_response(provider, response, true, move |frame| {
            parse_stream_frame(&frame_provider, &frame.data)
        }))
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let response = self
            .authorized(self.client.post(self.url("embeddings")))
            .json(&EmbeddingRequest { model, input: text })
            .timeout(self.call_timeout())
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::embedding(format!("Failed to parse embedding response: {}", e)))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::embedding("Embedding response was empty"))
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self.authorized(self.client.get(self.url("models")));
        match request.timeout(self.call_timeout()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
