//! Streaming replies as OpenAI-style SSE frames
//!
//! One task per reply reads provider deltas and forwards them to the client.
//! Client disconnect, upstream errors and the stream deadline all end the task;
//! whatever arrived by then is persisted, and the upstream call is aborted.

use axum::response::sse::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::error::{Error, ProviderErrorKind, Result};
use crate::providers::{DeltaStream, ModelSelection};
use crate::types::chat::{ChatCompletionChunk, ChunkChoice, ChunkDelta};

use super::service::{ChatService, PreparedTurn};

const FRAME_BUFFER: usize = 32;

/// One SSE event of a streamed reply
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    /// Terminal `data: [DONE]`, sent only after a successful reply
    Done,
    /// `event: error` with the error body; no `[DONE]` follows
    Error(serde_json::Value),
}

impl StreamFrame {
    pub fn into_event(self) -> Event {
        match self {
            Self::Chunk(chunk) => match serde_json::to_string(&chunk) {
                Ok(json) => Event::default().data(json),
                Err(e) => Event::default()
                    .event("error")
                    .data(Error::internal(format!("Failed to encode frame: {}", e)).to_json().to_string()),
            },
            Self::Done => Event::default().data("[DONE]"),
            Self::Error(body) => Event::default().event("error").data(body.to_string()),
        }
    }
}

enum StreamEnd {
    Finished,
    Failed(Error),
    Cancelled,
}

impl ChatService {
    /// Start streaming a prepared turn; frames arrive on the returned receiver.
    ///
    /// Dropping the receiver cancels the reply.
    pub fn stream(self: Arc<Self>, turn: PreparedTurn) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        tokio::spawn(async move {
            self.drive(turn, tx).await;
        });
        rx
    }

    async fn drive(&self, turn: PreparedTurn, tx: mpsc::Sender<StreamFrame>) {
        let (mut deltas, selection) = match self.open(&turn).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("Failed to open stream for {}: {}", turn.conversation_id, e);
                self.persist(&turn, String::new(), &turn.selection, Some(e.to_string()))
                    .await;
                let _ = tx.send(StreamFrame::Error(e.to_json())).await;
                return;
            }
        };

        let model = selection.label();
        let first = self.chunk(&turn, &model, ChunkDelta {
            role: Some("assistant".to_string()),
            content: None,
        }, None, true);
        if tx.send(StreamFrame::Chunk(first)).await.is_err() {
            deltas.cancel();
            self.persist(&turn, String::new(), &selection, Some("cancelled by client".into()))
                .await;
            return;
        }

        let deadline = Instant::now() + self.stream_timeout();
        let mut content = String::new();

        let end = loop {
            tokio::select! {
                _ = tx.closed() => break StreamEnd::Cancelled,
                _ = sleep_until(deadline) => {
                    break StreamEnd::Failed(Error::provider(
                        selection.provider.name(),
                        ProviderErrorKind::Timeout,
                        format!("stream exceeded {}s", self.stream_timeout().as_secs()),
                    ));
                }
                delta = deltas.next_delta() => match delta {
                    Some(Ok(text)) => {
                        content.push_str(&text);
                        let frame = self.chunk(&turn, &model, ChunkDelta {
                            role: None,
                            content: Some(text),
                        }, None, false);
                        if tx.send(StreamFrame::Chunk(frame)).await.is_err() {
                            break StreamEnd::Cancelled;
                        }
                    }
                    Some(Err(e)) => break StreamEnd::Failed(e),
                    None => break StreamEnd::Finished,
                },
            }
        };

        match end {
            StreamEnd::Finished => {
                self.persist(&turn, content, &selection, None).await;
                let last = self.chunk(&turn, &model, ChunkDelta::default(), Some("stop"), false);
                if tx.send(StreamFrame::Chunk(last)).await.is_ok() {
                    let _ = tx.send(StreamFrame::Done).await;
                }
                tracing::info!("Streamed reply {} with {}", turn.reply.id, model);
            }
            StreamEnd::Failed(e) => {
                deltas.cancel();
                tracing::warn!("Stream for reply {} failed: {}", turn.reply.id, e);
                self.persist(&turn, content, &selection, Some(e.to_string())).await;
                let _ = tx.send(StreamFrame::Error(e.to_json())).await;
            }
            StreamEnd::Cancelled => {
                deltas.cancel();
                tracing::info!("Client disconnected from reply {}", turn.reply.id);
                self.persist(&turn, content, &selection, Some("cancelled by client".into()))
                    .await;
            }
        }
    }

    /// Open the upstream stream; only this step may fall back to another provider
    async fn open(&self, turn: &PreparedTurn) -> Result<(DeltaStream, ModelSelection)> {
        let primary = &turn.selection;
        match primary
            .provider
            .stream_chat(&turn.messages, &primary.model, &turn.options)
            .await
        {
            Ok(deltas) => Ok((deltas, primary.clone())),
            Err(e) if e.is_retryable() => {
                let fallback = match self.selector().fallback_after(primary, turn.needs_vision) {
                    Some(fallback) => fallback,
                    None => return Err(e),
                };
                tracing::warn!("{} failed ({}), falling back to {}", primary.label(), e, fallback.label());
                let deltas = fallback
                    .provider
                    .stream_chat(&turn.messages, &fallback.model, &turn.options)
                    .await?;
                Ok((deltas, fallback))
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, turn: &PreparedTurn, content: String, selection: &ModelSelection, error: Option<String>) {
        if let Err(e) = self.finish(turn, content, &selection.label(), error).await {
            tracing::error!("Failed to persist reply {}: {}", turn.reply.id, e);
        }
    }

    fn chunk(
        &self,
        turn: &PreparedTurn,
        model: &str,
        delta: ChunkDelta,
        finish_reason: Option<&str>,
        first: bool,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: turn.completion_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: turn.created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
            conversation_id: first.then_some(turn.conversation_id),
            message_id: first.then_some(turn.reply.id),
            branch_id: first.then_some(turn.reply.branch_id),
            sources: first.then(|| turn.sources.clone()),
        }
    }
}
