//! Anthropic Messages API adapter

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ProviderSettings;
use crate::error::{Error, ProviderErrorKind, Result};
use crate::types::Role;

use super::stream::{DeltaStream, FrameAction};
use super::{
    build_http_client, check_status, classify_error_label, transport_error, ChatMessage,
    ChatOptions, ChatProvider, ProviderKind, with_call_timeout,
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for `POST /v1/messages`
pub struct AnthropicProvider {
    settings: ProviderSettings,
    client: Client,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: TextDelta },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(default, rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = build_http_client(Duration::from_secs(settings.timeout_secs))?;
        Ok(Self { settings, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", self.settings.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", API_VERSION)
    }

    /// System messages go to the top-level `system` field; the rest become content blocks
    fn build_request(messages: &[ChatMessage], model: &str, options: &ChatOptions, stream: bool) -> MessagesRequest {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let mut blocks: Vec<Value> = m
                    .images
                    .iter()
                    .map(|img| {
                        json!({
                            "type": "image",
                            "source": { "type": "base64", "media_type": img.mime_type, "data": img.data }
                        })
                    })
                    .collect();
                blocks.push(json!({ "type": "text", "text": m.content }));
                json!({ "role": m.role.as_str(), "content": blocks })
            })
            .collect();

        MessagesRequest {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            stream,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            temperature: options.temperature,
        }
    }

    fn request(&self, messages: &[ChatMessage], model: &str, options: &ChatOptions, stream: bool) -> RequestBuilder {
        let body = Self::build_request(messages, model, options, stream);
        let builder = self.authorized(self.client.post(self.url("messages"))).json(&body);
        with_call_timeout(builder, options, Duration::from_secs(self.settings.timeout_secs), stream)
    }
}

fn parse_stream_frame(provider: &str, data: &str) -> FrameAction {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::ContentBlockDelta { delta }) => match delta.text {
            Some(text) => FrameAction::Delta(text),
            None => FrameAction::Skip,
        },
        Ok(StreamEvent::MessageStop {}) => FrameAction::Done,
        Ok(StreamEvent::Error { error }) => FrameAction::Error(Error::provider(
            provider,
            classify_error_label(&error.error_type),
            error.message,
        )),
        Ok(StreamEvent::Other) | Err(_) => FrameAction::Skip,
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn name(&self) -> &str {
        "anthropic"
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
        tracing::info!("Chat completion via anthropic ({})", model);

        let response = self
            .request(messages, model, options, false)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        Ok(body.content.into_iter().filter_map(|b| b.text).collect())
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream> {
        tracing::info!("Streaming completion via anthropic ({})", model);

        let response = self
            .request(messages, model, options, true)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        Ok(DeltaStream::from_sse_response(self.name().to_string(), response, true, |frame| {
            parse_stream_frame("anthropic", &frame.data)
        }))
    }

    async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>> {
        Err(Error::provider(
            self.name(),
            ProviderErrorKind::InvalidRequest,
            "Anthropic does not offer an embedding endpoint",
        ))
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self.authorized(self.client.get(self.url("models")));
        match request.timeout(Duration::from_secs(self.settings.timeout_secs)).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
