//! Conversation and branch management endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::{BranchInfo, Conversation, Message};

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversationRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(default)]
    pub space_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Every stored message instead of just the active path
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBranchRequest {
    /// Any message; the active path is extended from it to a leaf
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MergeBranchRequest {
    pub source_branch_id: Uuid,
    pub target_message_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: usize,
    pub branch_count: usize,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub conversation_id: Uuid,
    pub active_leaf_id: Option<Uuid>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct BranchesResponse {
    pub conversation_id: Uuid,
    pub active_leaf_id: Option<Uuid>,
    pub branches: Vec<BranchInfo>,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub branch_id: Uuid,
    pub active_leaf_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct DeleteBranchResponse {
    pub deleted_messages: usize,
    pub active_leaf_id: Option<Uuid>,
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New conversation".to_string());
    let conversation = state.conversations().create(request.space_id, title).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<Conversation>>> {
    Ok(Json(state.conversations().list(query.space_id.as_deref())?))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationDetail>> {
    let tree = state.conversations().snapshot(id).await?;
    Ok(Json(ConversationDetail {
        conversation: tree.conversation().clone(),
        message_count: tree.len(),
        branch_count: tree.branch_count(),
    }))
}

/// PATCH /api/conversations/:id
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateConversationRequest>,
) -> Result<Json<Conversation>> {
    let title = request.title.trim().to_string();
    if title.is_empty() {
        return Err(Error::validation("title must not be empty"));
    }
    Ok(Json(state.conversations().rename(id, title).await?))
}

/// DELETE /api/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.conversations().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/conversations/:id/messages - Active path, or all messages with `?all=true`
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>> {
    let tree = state.conversations().snapshot(id).await?;
    let messages = if query.all {
        tree.messages()
    } else {
        tree.active_path()
    };
    Ok(Json(MessagesResponse {
        conversation_id: id,
        active_leaf_id: tree.active_leaf(),
        messages: messages.into_iter().cloned().collect(),
    }))
}

/// GET /api/conversations/:id/branches
pub async fn list_branches(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BranchesResponse>> {
    let tree = state.conversations().snapshot(id).await?;
    Ok(Json(BranchesResponse {
        conversation_id: id,
        active_leaf_id: tree.active_leaf(),
        branches: tree.branches(),
    }))
}

/// POST /api/conversations/:id/switch
pub async fn switch_branch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SwitchBranchRequest>,
) -> Result<Json<MessagesResponse>> {
    let leaf = state
        .conversations()
        .switch_branch(id, request.message_id)
        .await?;
    let tree = state.conversations().snapshot(id).await?;
    Ok(Json(MessagesResponse {
        conversation_id: id,
        active_leaf_id: Some(leaf),
        messages: tree.active_path().into_iter().cloned().collect(),
    }))
}

/// POST /api/conversations/:id/merge
pub async fn merge_branch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MergeBranchRequest>,
) -> Result<Json<MergeResponse>> {
    let branch_id = state
        .conversations()
        .merge_branch(id, request.source_branch_id, request.target_message_id)
        .await?;
    tracing::info!(
        "Merged branch {} onto message {} in {}",
        request.source_branch_id,
        request.target_message_id,
        id
    );
    let conversation = state.conversations().get(id).await?;
    Ok(Json(MergeResponse {
        branch_id,
        active_leaf_id: conversation.active_leaf_id,
    }))
}

/// DELETE /api/conversations/:id/branches/:branch_id
pub async fn delete_branch(
    State(state): State<AppState>,
    Path((id, branch_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeleteBranchResponse>> {
    let deleted_messages = state.conversations().delete_branch(id, branch_id).await?;
    let conversation = state.conversations().get(id).await?;
    Ok(Json(DeleteBranchResponse {
        deleted_messages,
        active_leaf_id: conversation.active_leaf_id,
    }))
}
