//! Document and chunk types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ingestion state of a document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Supported upload formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Pdf,
    Docx,
    Text,
    Markdown,
    Image,
}

impl FileKind {
    pub const DOCX_MIME: &'static str =
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

    /// Map a MIME type to a supported format
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Some(Self::Pdf),
            Self::DOCX_MIME => Some(Self::Docx),
            "text/plain" => Some(Self::Text),
            "text/markdown" | "text/x-markdown" => Some(Self::Markdown),
            "image/png" | "image/jpeg" | "image/gif" | "image/webp" => Some(Self::Image),
            _ => None,
        }
    }

    /// Resolve the MIME type of an upload, guessing from the filename when the client sent none
    pub fn resolve_mime(declared: Option<&str>, filename: &str) -> String {
        match declared.map(str::trim) {
            Some(m) if !m.is_empty() && m != "application/octet-stream" => m.to_string(),
            _ => {
                let lower = filename.to_ascii_lowercase();
                if lower.ends_with(".md") || lower.ends_with(".markdown") {
                    return "text/markdown".to_string();
                }
                mime_guess::from_path(filename)
                    .first_raw()
                    .unwrap_or("application/octet-stream")
                    .to_string()
            }
        }
    }
}

/// An uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    /// Owning space
    pub space_id: String,
    pub filename: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub mime_type: String,
    pub byte_size: u64,
    /// Key of the stored original bytes
    pub storage_ref: String,
    /// SHA-256 of the original bytes
    pub content_hash: String,
    pub processing_status: ProcessingStatus,
    pub error: Option<String>,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document waiting for ingestion
    pub fn pending(
        space_id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        byte_size: u64,
        content_hash: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            space_id: space_id.into(),
            filename: filename.into(),
            title: None,
            tags: Vec::new(),
            mime_type: mime_type.into(),
            byte_size,
            storage_ref: id.to_string(),
            content_hash: content_hash.into(),
            processing_status: ProcessingStatus::Pending,
            error: None,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.processing_status == ProcessingStatus::Completed
    }

    /// Title if set, else the filename
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.filename)
    }
}

/// A window of a document's extracted text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Position of the chunk within its document
    pub index: usize,
    /// Start offset (in characters) into the extracted text
    pub char_start: usize,
    /// End offset (exclusive, in characters)
    pub char_end: usize,
    /// Characters shared with the previous chunk
    pub overlap: usize,
    pub content: String,
}

impl Chunk {
    /// Deterministic id so re-ingestion replaces rather than duplicates
    pub fn chunk_id(document_id: Uuid, index: usize) -> Uuid {
        Uuid::new_v5(&document_id, index.to_string().as_bytes())
    }

    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}
