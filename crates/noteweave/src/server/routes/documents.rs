//! Document upload, status, content and lifecycle endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::{DocumentContent, IngestProgress, QueueStats, Upload};
use crate::server::state::AppState;
use crate::storage::DocumentStats;
use crate::types::Document;

#[derive(Debug, Deserialize)]
pub struct ListDocumentsQuery {
    #[serde(default)]
    pub space_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    /// Character offset into the extracted text
    #[serde(default)]
    pub offset: usize,
    /// Characters to return; the rest of the text when absent
    #[serde(default)]
    pub length: Option<usize>,
}

/// A document plus its live ingestion progress
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    #[serde(flatten)]
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<IngestProgress>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub documents: Vec<Document>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct IngestionStatsResponse {
    pub queue: QueueStats,
    pub documents: DocumentStats,
}

/// POST /api/documents - Upload files; ingestion continues in the background
///
/// Multipart fields: `space_id` (required), `title`, `tags` (comma separated) and one or
/// more `file` parts. Every file is validated before any is stored.
pub async fn upload_documents(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let mut space_id = None;
    let mut title = None;
    let mut tags = Vec::new();
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "space_id" | "title" | "tags" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read '{}': {}", name, e)))?;
                match name.as_str() {
                    "space_id" => space_id = Some(value.trim().to_string()),
                    "title" => title = Some(value),
                    _ => {
                        tags = value
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect()
                    }
                }
            }
            _ => {
                let Some(filename) = field.file_name().map(str::to_string) else {
                    tracing::debug!("Ignoring multipart field '{}'", name);
                    continue;
                };
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read {}: {}", filename, e)))?;
                files.push((filename, content_type, data.to_vec()));
            }
        }
    }

    let space_id = space_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("space_id is required"))?;
    if files.is_empty() {
        return Err(Error::validation("No files provided"));
    }

    let uploads: Vec<Upload> = files
        .into_iter()
        .map(|(filename, content_type, data)| Upload {
            space_id: space_id.clone(),
            filename,
            content_type,
            title: title.clone(),
            tags: tags.clone(),
            data,
        })
        .collect();

    for upload in &uploads {
        state.documents().validate(upload)?;
    }

    let mut documents = Vec::with_capacity(uploads.len());
    for upload in uploads {
        documents.push(state.documents().accept(upload).await?);
    }

    let message = format!(
        "{} document(s) queued. Poll /api/documents/:id for processing status.",
        documents.len()
    );
    Ok((StatusCode::CREATED, Json(UploadResponse { documents, message })))
}

/// GET /api/documents - List documents, optionally for one space
pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<Vec<Document>>> {
    Ok(Json(state.documents().list(query.space_id.as_deref())?))
}

/// GET /api/documents/:id
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentResponse>> {
    let document = state.documents().get(id)?;
    let progress = if document.is_ready() {
        None
    } else {
        state.queue().get_progress(id)
    };
    Ok(Json(DocumentResponse { document, progress }))
}

/// GET /api/documents/:id/content - Extracted text, paginated by character offset
pub async fn get_document_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ContentQuery>,
) -> Result<Json<DocumentContent>> {
    Ok(Json(state.documents().content(id, query.offset, query.length)?))
}

/// POST /api/documents/:id/reprocess - Re-run ingestion from the stored bytes
pub async fn reprocess_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Document>)> {
    let document = state.documents().reprocess(id).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

/// DELETE /api/documents/:id
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.documents().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/ingestion/stats
pub async fn ingestion_stats(State(state): State<AppState>) -> Result<Json<IngestionStatsResponse>> {
    Ok(Json(IngestionStatsResponse {
        queue: state.queue().stats(),
        documents: state.db().document_stats()?,
    }))
}
