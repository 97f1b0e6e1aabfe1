//! Image description through a vision-capable chat model

use async_trait::async_trait;

use crate::error::Result;

use super::{ChatMessage, ChatOptions, InlineImage, ModelSelector};

const DESCRIBE_PROMPT: &str = "Describe this image for a search index. Transcribe any visible \
text verbatim, then summarize what the image shows (objects, diagrams, charts, layout). \
Answer in plain prose without preamble.";

/// Turns an image into searchable text
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, image: &InlineImage) -> Result<String>;
}

/// Describes images with the best configured vision model
pub struct VisionDescriber {
    selector: ModelSelector,
    options: ChatOptions,
}

impl VisionDescriber {
    pub fn new(selector: ModelSelector, max_tokens: u32) -> Self {
        Self {
            selector,
            options: ChatOptions {
                temperature: Some(0.0),
                max_tokens: Some(max_tokens),
                timeout: None,
            },
        }
    }
}

#[async_trait]
impl ImageDescriber for VisionDescriber {
    async fn describe(&self, image: &InlineImage) -> Result<String> {
        let selection = self.selector.select(None, true)?;
        tracing::debug!("Describing {} image with {}", image.mime_type, selection.label());

        let messages = [ChatMessage::user(DESCRIBE_PROMPT).with_images(vec![image.clone()])];
        selection
            .provider
            .chat(&messages, &selection.model, &self.options)
            .await
    }
}
