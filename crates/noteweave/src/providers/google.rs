//! Google Gemini (Generative Language API) adapter

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
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

/// Adapter for `generateContent` / `streamGenerateContent` / `embedContent`
pub struct GoogleProvider {
    settings: ProviderSettings,
    client: Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

impl GenerateResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default()
    }
}

impl GoogleProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = build_http_client(Duration::from_secs(settings.timeout_secs))?;
        Ok(Self { settings, client })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:{}",
            self.settings.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("x-goog-api-key", self.settings.api_key.as_deref().unwrap_or_default())
    }

    /// Gemini calls the assistant role "model" and takes the system prompt separately
    fn build_body(messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                let mut parts = vec![json!({ "text": m.content })];
                parts.extend(m.images.iter().map(|img| {
                    json!({ "inline_data": { "mime_type": img.mime_type, "data": img.data } })
                }));
                json!({ "role": role, "parts": parts })
            })
            .collect();

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = options.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(max) = options.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max));
        }

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }
        body
    }

    fn request(&self, url: String, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> RequestBuilder {
        let builder = self
            .authorized(self.client.post(url))
            .json(&Self::build_body(messages, options));
        with_call_timeout(builder, options, self.call_timeout(), stream)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }
}

fn parse_stream_frame(data: &str) -> FrameAction {
    let chunk: GenerateResponse = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(_) => return FrameAction::Skip,
    };
    if let Some(err) = chunk.error {
        return FrameAction::Error(Error::provider(
            "google",
            classify_error_label(&err.status),
            err.message,
        ));
    }
    // the stream simply ends after the last candidate; there is no stop event
    FrameAction::Delta(chunk.text())
}

#[async_trait]
impl ChatProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn name(&self) -> &str {
        "google"
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
        tracing::info!("Chat completion via google ({})", model);

        let response = self
            .request(self.model_url(model, "generateContent"), messages, options, false)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        if let Some(err) = body.error {
            return Err(Error::provider(self.name(), classify_error_label(&err.status), err.message));
        }
        Ok(body.text())
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &ChatOptions,
    ) -> Result<DeltaStream> {
        tracing::info!("Streaming completion via google ({})", model);

        let url = format!("{}?alt=sse", self.model_url(model, "streamGenerateContent"));
        let response = self
            .request(url, messages, options, true)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        Ok(DeltaStream::from_sse_response(self.name().to_string(), response, false, |frame| {
            parse_stream_frame(&frame.data)
        }))
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let body = json!({ "content": { "parts": [{ "text": text }] } });
        let response = self
            .authorized(self.client.post(self.model_url(model, "embedContent")))
            .json(&body)
            .timeout(self.call_timeout())
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::embedding(format!("Failed to parse embedding response: {}", e)))?;
        if body.embedding.values.is_empty() {
            return Err(Error::provider(self.name(), ProviderErrorKind::InvalidRequest, "empty embedding"));
        }
        Ok(body.embedding.values)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.settings.base_url.trim_end_matches('/'));
        match self.authorized(self.client.get(url)).timeout(self.call_timeout()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_maps_roles() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ];
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        let body = GoogleProvider::build_body(&messages, &options);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert!(body["generationConfig"]["maxOutputTokens"].is_null());
    }

    #[test]
    fn test_stream_frames() {
        let frame = r#"{"candidates":[{"content":{"parts":[{"text":"Hi "},{"text":"there"}],"role":"model"}}]}"#;
        assert!(matches!(parse_stream_frame(frame), FrameAction::Delta(t) if t == "Hi there"));

        let err = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        match parse_stream_frame(err) {
            FrameAction::Error(Error::Provider { kind, .. }) => assert_eq!(kind, ProviderErrorKind::RateLimited),
            other => panic!("unexpected {:?}", other),
        }
    }
}
