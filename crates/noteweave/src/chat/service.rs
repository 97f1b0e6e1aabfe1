//! Chat turns: preparation, provider dispatch with one fallback, persistence

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::conversation::{ConversationStore, MessageDraft};
use crate::error::{Error, Result};
use crate::providers::{ChatMessage, ChatOptions, InlineImage, ModelSelection, ModelSelector};
use crate::retrieval::{ContextRetriever, RetrievalRequest, RetrievedContext};
use crate::types::chat::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, MessageContent, RequestMessage,
    ResponseMessage,
};
use crate::types::{Message, MessageStatus, Role, Source};

use super::prompt::PromptBuilder;

const TITLE_CHARS: usize = 60;

/// Body of `POST /api/messages/:id/regenerate`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Everything needed to generate one assistant reply
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub conversation_id: Uuid,
    /// Assistant placeholder the reply is written into
    pub reply: Message,
    pub messages: Vec<ChatMessage>,
    pub sources: Vec<Source>,
    pub selection: ModelSelection,
    pub needs_vision: bool,
    pub options: ChatOptions,
    /// `chatcmpl-…` id shared by every frame of the reply
    pub completion_id: String,
    pub created: i64,
}

/// Grounded, multi-provider chat over persistent conversations
pub struct ChatService {
    conversations: Arc<ConversationStore>,
    retriever: Arc<ContextRetriever>,
    selector: ModelSelector,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        conversations: Arc<ConversationStore>,
        retriever: Arc<ContextRetriever>,
        selector: ModelSelector,
        config: ChatConfig,
    ) -> Self {
        Self {
            conversations,
            retriever,
            selector,
            config,
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub(crate) fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub(crate) fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stream_timeout_secs)
    }

    /// Validate a request, record the user message and an assistant placeholder, build the prompt
    pub async fn prepare(&self, request: &ChatCompletionRequest) -> Result<PreparedTurn> {
        let last = request
            .messages
            .last()
            .ok_or_else(|| Error::validation("messages must not be empty"))?;
        if last.role != "user" {
            return Err(Error::validation("The last message must have role 'user'"));
        }
        let text = last.content.text();
        let images = parse_images(&last.content)?;
        if text.trim().is_empty() && images.is_empty() {
            return Err(Error::validation("The last message is empty"));
        }

        let needs_vision = !images.is_empty();
        let selection = self.selector.select(request.model.as_deref(), needs_vision)?;
        let instructions: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.text())
            .collect();

        let seed = seed_history(&request.messages[..request.messages.len() - 1])?;

        // nothing is written until the request is known to be valid
        let existing = match request.conversation_id {
            Some(id) => {
                let tree = self.conversations.snapshot(id).await?;
                if let Some(parent) = request.parent_message_id {
                    if tree.get(parent).is_none() {
                        return Err(Error::not_found("message", parent));
                    }
                }
                Some(tree.conversation().clone())
            }
            None if request.parent_message_id.is_some() => {
                return Err(Error::validation("parent_message_id requires conversation_id"));
            }
            None => None,
        };

        let space_id = request
            .space_id
            .clone()
            .or_else(|| existing.as_ref().and_then(|c| c.space_id.clone()));
        let context = self
            .retrieve(space_id, request.document_ids.clone(), &text)
            .await?;

        // earlier request messages seed a new conversation; an existing one has its own history
        let (conversation, seed) = match existing {
            Some(conversation) => (conversation, Vec::new()),
            None => {
                let conversation = self
                    .conversations
                    .create(request.space_id.clone(), title_from(&text))
                    .await?;
                (conversation, seed)
            }
        };

        let image_urls = images.iter().map(InlineImage::data_url).collect();
        let user = MessageDraft::user(text, request.document_ids.clone()).with_images(image_urls);
        let recorded = self
            .record_turn(conversation.id, request.parent_message_id, seed, user, request.document_ids.clone())
            .await;
        let (user, reply) = match recorded {
            Ok(pair) => pair,
            Err(e) => {
                if request.conversation_id.is_none() {
                    if let Err(cleanup) = self.conversations.delete(conversation.id).await {
                        tracing::warn!("Failed to discard conversation {}: {}", conversation.id, cleanup);
                    }
                }
                return Err(e);
            }
        };

        let tree = self.conversations.snapshot(conversation.id).await?;
        let system = PromptBuilder::system_message(&self.config.system_prompt, &instructions, &context);
        let messages = PromptBuilder::build_messages(system, &tree.path_to(user.id));

        Ok(self.turn(
            conversation.id,
            reply,
            messages,
            &context,
            selection,
            needs_vision,
            request.temperature,
            request.max_tokens,
        ))
    }

    /// Append seeded history, the user message and the reply placeholder
    async fn record_turn(
        &self,
        conversation_id: Uuid,
        mut parent: Option<Uuid>,
        seed: Vec<MessageDraft>,
        user: MessageDraft,
        document_ids: Vec<Uuid>,
    ) -> Result<(Message, Message)> {
        for draft in seed {
            parent = Some(self.conversations.append(conversation_id, parent, draft).await?.id);
        }
        let user = self.conversations.append(conversation_id, parent, user).await?;
        let reply = self
            .conversations
            .append(
                conversation_id,
                Some(user.id),
                MessageDraft::assistant_placeholder(document_ids),
            )
            .await?;
        Ok((user, reply))
    }

    /// New sibling of an assistant message, prompted with the path up to its parent
    ///
    /// Images stored with the parent user message are sent again.
    pub async fn prepare_regeneration(&self, message_id: Uuid, request: &RegenerateRequest) -> Result<PreparedTurn> {
        let (conversation_id, original) = self.conversations.find_message(message_id).await?;
        if original.role != Role::Assistant {
            return Err(Error::validation("Only assistant messages can be regenerated"));
        }
        let parent_id = original
            .parent_id
            .ok_or_else(|| Error::internal("assistant message has no parent"))?;

        let tree = self.conversations.snapshot(conversation_id).await?;
        let path = tree.path_to(parent_id);
        let query = path.last().map(|m| m.content.clone()).unwrap_or_default();
        let needs_vision = path.last().is_some_and(|m| !PromptBuilder::images_of(m).is_empty());
        let selection = self.selector.select(request.model.as_deref(), needs_vision)?;

        let context = self
            .retrieve(tree.conversation().space_id.clone(), original.document_ids.clone(), &query)
            .await?;
        let system = PromptBuilder::system_message(&self.config.system_prompt, &[], &context);
        let messages = PromptBuilder::build_messages(system, &path);

        let (_, reply) = self.conversations.regenerate(message_id).await?;

        Ok(self.turn(
            conversation_id,
            reply,
            messages,
            &context,
            selection,
            needs_vision,
            request.temperature,
            request.max_tokens,
        ))
    }

    /// Generate the whole reply; a retryable failure falls back to the next provider once
    pub async fn complete(&self, turn: PreparedTurn) -> Result<ChatCompletionResponse> {
        let mut options = turn.options.clone();
        options.timeout = Some(Duration::from_secs(self.config.request_timeout_secs));

        let result = match turn
            .selection
            .provider
            .chat(&turn.messages, &turn.selection.model, &options)
            .await
        {
            Ok(content) => Ok((content, turn.selection.clone())),
            Err(e) if e.is_retryable() => match self.selector.fallback_after(&turn.selection, turn.needs_vision) {
                Some(fallback) => {
                    tracing::warn!(
                        "{} failed ({}), falling back to {}",
                        turn.selection.label(),
                        e,
                        fallback.label()
                    );
                    fallback
                        .provider
                        .chat(&turn.messages, &fallback.model, &options)
                        .await
                        .map(|content| (content, fallback))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok((content, selection)) => {
                let message = self
                    .finish(&turn, content, &selection.label(), None)
                    .await?;
                Ok(ChatCompletionResponse {
                    id: turn.completion_id.clone(),
                    object: "chat.completion".to_string(),
                    created: turn.created,
                    model: selection.label(),
                    choices: vec![Choice {
                        index: 0,
                        message: ResponseMessage {
                            role: "assistant".to_string(),
                            content: message.content,
                        },
                        finish_reason: "stop".to_string(),
                    }],
                    conversation_id: turn.conversation_id,
                    message_id: message.id,
                    branch_id: message.branch_id,
                    sources: turn.sources.clone(),
                })
            }
            Err(e) => {
                tracing::error!("Chat completion for {} failed: {}", turn.conversation_id, e);
                if let Err(persist) = self
                    .finish(&turn, String::new(), &turn.selection.label(), Some(e.to_string()))
                    .await
                {
                    tracing::error!("Failed to record failed reply {}: {}", turn.reply.id, persist);
                }
                Err(e)
            }
        }
    }

    /// Write the reply's final content and status
    pub(crate) async fn finish(
        &self,
        turn: &PreparedTurn,
        content: String,
        model: &str,
        error: Option<String>,
    ) -> Result<Message> {
        let model = model.to_string();
        self.conversations
            .update_message(turn.conversation_id, turn.reply.id, move |message| {
                message.content = content;
                message.model = Some(model);
                message.status = if error.is_some() {
                    MessageStatus::Error
                } else {
                    MessageStatus::Complete
                };
                message.error = error;
            })
            .await
    }

    async fn retrieve(&self, space_id: Option<String>, document_ids: Vec<Uuid>, query: &str) -> Result<RetrievedContext> {
        if space_id.is_none() && document_ids.is_empty() {
            return Ok(RetrievedContext::default());
        }
        self.retriever
            .retrieve(&RetrievalRequest {
                space_id,
                document_ids,
                query: Some(query.to_string()),
                token_budget: None,
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn turn(
        &self,
        conversation_id: Uuid,
        reply: Message,
        messages: Vec<ChatMessage>,
        context: &RetrievedContext,
        selection: ModelSelection,
        needs_vision: bool,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> PreparedTurn {
        PreparedTurn {
            conversation_id,
            completion_id: format!("chatcmpl-{}", reply.id.simple()),
            created: Utc::now().timestamp(),
            reply,
            messages,
            sources: PromptBuilder::sources(context),
            selection,
            needs_vision,
            options: ChatOptions {
                temperature: Some(temperature.unwrap_or(self.config.temperature)),
                max_tokens: Some(max_tokens.unwrap_or(self.config.max_tokens)),
                timeout: None,
            },
        }
    }
}

/// Drafts for the earlier messages of a request; system messages become instructions instead
fn seed_history(messages: &[RequestMessage]) -> Result<Vec<MessageDraft>> {
    let mut drafts = Vec::new();
    for earlier in messages {
        let role = match Role::parse(&earlier.role) {
            Some(Role::System) => continue,
            Some(role) => role,
            None => return Err(Error::validation(format!("Unsupported role '{}'", earlier.role))),
        };
        drafts.push(MessageDraft {
            role,
            content: earlier.content.text(),
            document_ids: Vec::new(),
            status: MessageStatus::Complete,
            images: Vec::new(),
        });
    }
    Ok(drafts)
}

fn parse_images(content: &MessageContent) -> Result<Vec<InlineImage>> {
    content
        .image_urls()
        .into_iter()
        .map(|url| {
            InlineImage::from_data_url(url)
                .ok_or_else(|| Error::validation("Images must be sent as base64 data: URLs"))
        })
        .collect()
}

fn title_from(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.is_empty() {
        return "New conversation".to_string();
    }
    let mut title: String = line.chars().take(TITLE_CHARS).collect();
    if line.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    title
}
