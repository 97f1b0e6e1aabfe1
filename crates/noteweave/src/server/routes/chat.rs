//! Chat completion, regeneration, context and provider endpoints

use axum::{
    extract::{Path, State},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::chat::{PreparedTurn, RegenerateRequest};
use crate::error::Result;
use crate::providers::registry::ProviderInfo;
use crate::retrieval::{RetrievalRequest, RetrievedContext};
use crate::server::state::AppState;
use crate::types::chat::ChatCompletionRequest;

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub embedding_model: String,
}

/// POST /v1/chat/completions - OpenAI-compatible chat, streamed when `stream` is true
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    tracing::info!(
        "Chat request: model={:?} stream={} documents={}",
        request.model,
        request.stream,
        request.document_ids.len()
    );
    let turn = state.chat().prepare(&request).await?;
    respond(&state, turn, request.stream).await
}

/// POST /api/messages/:id/regenerate - New reply next to an existing one
pub async fn regenerate_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    body: Option<Json<RegenerateRequest>>,
) -> Result<Response> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let turn = state
        .chat()
        .prepare_regeneration(message_id, &request)
        .await?;
    respond(&state, turn, request.stream).await
}

async fn respond(state: &AppState, turn: PreparedTurn, stream: bool) -> Result<Response> {
    if !stream {
        let response = state.chat().complete(turn).await?;
        return Ok(Json(response).into_response());
    }

    let frames = state.chat().clone().stream(turn);
    let events = ReceiverStream::new(frames).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// POST /api/spaces/:space_id/context - Grounding context for a query
pub async fn space_context(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    Json(mut request): Json<RetrievalRequest>,
) -> Result<Json<RetrievedContext>> {
    request.space_id = Some(space_id);
    Ok(Json(state.retriever().retrieve(&request).await?))
}

/// GET /api/providers - Configured providers in fallback order
pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.registry().describe(),
        embedding_model: state.config().embeddings.model_id(),
    })
}
