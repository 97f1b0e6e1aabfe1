//! API routes for the chat server

pub mod chat;
pub mod conversations;
pub mod documents;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use crate::server::state::AppState;

/// Build all `/api` routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Documents - with a larger body limit for uploads
        .route(
            "/documents",
            get(documents::list_documents)
                .post(documents::upload_documents)
                .layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route(
            "/documents/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/documents/:id/content", get(documents::get_document_content))
        .route("/documents/:id/reprocess", post(documents::reprocess_document))
        .route("/ingestion/stats", get(documents::ingestion_stats))
        // Retrieval
        .route("/spaces/:space_id/context", post(chat::space_context))
        // Conversations
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/:id",
            get(conversations::get_conversation)
                .patch(conversations::update_conversation)
                .delete(conversations::delete_conversation),
        )
        .route("/conversations/:id/messages", get(conversations::list_messages))
        .route("/conversations/:id/branches", get(conversations::list_branches))
        .route(
            "/conversations/:id/branches/:branch_id",
            delete(conversations::delete_branch),
        )
        .route("/conversations/:id/switch", post(conversations::switch_branch))
        .route("/conversations/:id/merge", post(conversations::merge_branch))
        .route("/messages/:id/regenerate", post(chat::regenerate_message))
        // Chat
        .route("/chat/completions", post(chat::chat_completions))
        .route("/providers", get(chat::list_providers))
        .route("/info", get(info))
}

/// OpenAI-compatible `/v1` routes
pub fn openai_routes() -> Router<AppState> {
    Router::new().route("/chat/completions", post(chat::chat_completions))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "noteweave",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Retrieval-augmented chat over uploaded documents",
        "endpoints": {
            "POST /api/documents": "Upload documents (multipart: space_id, file, title, tags)",
            "GET /api/documents": "List documents",
            "GET /api/documents/:id": "Document status and ingestion progress",
            "GET /api/documents/:id/content": "Extracted text (offset, length)",
            "POST /api/documents/:id/reprocess": "Re-run ingestion",
            "DELETE /api/documents/:id": "Delete a document",
            "GET /api/ingestion/stats": "Ingestion queue statistics",
            "POST /api/spaces/:space_id/context": "Retrieve grounding context",
            "POST /v1/chat/completions": "OpenAI-compatible chat (stream or not)",
            "POST /api/messages/:id/regenerate": "Regenerate an assistant reply",
            "GET /api/conversations": "List conversations",
            "GET /api/conversations/:id/branches": "List branches",
            "POST /api/conversations/:id/switch": "Switch the active branch",
            "POST /api/conversations/:id/merge": "Merge a branch",
            "GET /api/providers": "Configured AI providers"
        }
    }))
}
