//! Document intake and lifecycle: upload, content read, reprocess, delete

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::retrieval::VectorIndex;
use crate::storage::{BlobStore, Database};
use crate::types::{Document, FileKind, ProcessingStatus};

use super::queue::IngestQueue;

/// An uploaded file plus its descriptive fields
#[derive(Debug, Clone)]
pub struct Upload {
    pub space_id: String,
    pub filename: String,
    /// MIME type sent by the client, if any
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub data: Vec<u8>,
}

/// Extracted text of a document, or why it is unavailable
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentContent {
    Ready {
        document_id: Uuid,
        offset: usize,
        length: usize,
        total_chars: usize,
        text: String,
    },
    NotReady {
        document_id: Uuid,
        processing_status: ProcessingStatus,
    },
    Failed {
        document_id: Uuid,
        error: Option<String>,
    },
}

/// Accepts uploads synchronously and hands them to background ingestion
pub struct DocumentService {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn VectorIndex>,
    queue: Arc<IngestQueue>,
    max_upload_size: usize,
}

impl DocumentService {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn VectorIndex>,
        queue: Arc<IngestQueue>,
        max_upload_size: usize,
    ) -> Self {
        Self {
            db,
            blobs,
            index,
            queue,
            max_upload_size,
        }
    }

    /// Check an upload and resolve its MIME type; nothing is stored on failure
    pub fn validate(&self, upload: &Upload) -> Result<String> {
        if upload.filename.trim().is_empty() {
            return Err(Error::validation("Upload has no filename"));
        }
        if upload.data.is_empty() {
            return Err(Error::validation(format!("'{}' is empty", upload.filename)));
        }
        if upload.data.len() > self.max_upload_size {
            return Err(Error::validation(format!(
                "'{}' is {} bytes, the limit is {}",
                upload.filename,
                upload.data.len(),
                self.max_upload_size
            )));
        }

        let mime = FileKind::resolve_mime(upload.content_type.as_deref(), &upload.filename);
        if FileKind::from_mime(&mime).is_none() {
            return Err(Error::validation(format!(
                "Unsupported file type '{}' for '{}'",
                mime, upload.filename
            )));
        }
        Ok(mime)
    }

    /// Store the upload, record it as pending and queue ingestion
    pub async fn accept(&self, upload: Upload) -> Result<Document> {
        let mime = self.validate(&upload)?;
        let hash = hex::encode(Sha256::digest(&upload.data));

        let mut doc = Document::pending(
            upload.space_id,
            upload.filename,
            mime,
            upload.data.len() as u64,
            hash,
        );
        doc.title = upload.title.filter(|t| !t.trim().is_empty());
        doc.tags = upload.tags;

        doc.storage_ref = self.blobs.put(&doc.id, &doc.filename, &upload.data).await?;
        if let Err(e) = self.db.insert_document(&doc) {
            if let Err(cleanup) = self.blobs.delete(&doc.id).await {
                tracing::warn!("Failed to remove orphaned bytes of {}: {}", doc.id, cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "Accepted upload '{}' ({} bytes, {}) as {}",
            doc.filename,
            doc.byte_size,
            doc.mime_type,
            doc.id
        );
        self.queue.submit(doc.id).await?;
        Ok(doc)
    }

    pub fn get(&self, id: Uuid) -> Result<Document> {
        self.db
            .get_document(id)?
            .ok_or_else(|| Error::not_found("document", id))
    }

    pub fn list(&self, space_id: Option<&str>) -> Result<Vec<Document>> {
        self.db.list_documents(space_id)
    }

    /// A window of the extracted text, measured in characters; never waits on ingestion
    pub fn content(&self, id: Uuid, offset: usize, length: Option<usize>) -> Result<DocumentContent> {
        let doc = self.get(id)?;
        match doc.processing_status {
            ProcessingStatus::Completed => {}
            ProcessingStatus::Failed => {
                return Ok(DocumentContent::Failed {
                    document_id: id,
                    error: doc.error,
                })
            }
            status => {
                return Ok(DocumentContent::NotReady {
                    document_id: id,
                    processing_status: status,
                })
            }
        }

        let text = self.db.get_document_text(id)?.unwrap_or_default();
        let total_chars = text.chars().count();
        let window: String = text
            .chars()
            .skip(offset)
            .take(length.unwrap_or(usize::MAX))
            .collect();

        Ok(DocumentContent::Ready {
            document_id: id,
            offset,
            length: window.chars().count(),
            total_chars,
            text: window,
        })
    }

    /// Re-run ingestion from the stored bytes
    pub async fn reprocess(&self, id: Uuid) -> Result<Document> {
        self.db.reset_for_reprocess(id)?;
        tracing::info!("Reprocessing document {}", id);
        self.queue.submit(id).await?;
        self.get(id)
    }

    /// Delete the record, its index entries and its stored bytes
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let doc = self.get(id)?;
        self.index.delete_by_document(id).await?;
        if !self.db.delete_document(id)? {
            return Err(Error::not_found("document", id));
        }
        self.queue.forget(id);

        if let Err(e) = self.blobs.delete(&doc.id).await {
            tracing::warn!("Failed to delete stored bytes of {}: {}", id, e);
        }
        tracing::info!("Deleted document {} ({})", id, doc.filename);
        Ok(())
    }

    /// Re-queue documents left pending or interrupted by a previous run
    pub async fn resume_pending(&self) -> Result<usize> {
        let ids = self.db.recover_interrupted()?;
        for id in &ids {
            self.queue.submit(*id).await?;
        }
        if !ids.is_empty() {
            tracing::info!("Resumed ingestion of {} documents", ids.len());
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::SqliteVectorIndex;
    use crate::storage::LocalBlobStore;

    struct Harness {
        service: DocumentService,
        db: Database,
        rx: tokio::sync::mpsc::Receiver<Uuid>,
        _dir: tempfile::TempDir,
    }

    fn harness(max_upload_size: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let (queue, rx) = IngestQueue::new(1);
        let service = DocumentService::new(
            db.clone(),
            Arc::new(LocalBlobStore::new(dir.path().to_path_buf()).unwrap()),
            Arc::new(SqliteVectorIndex::new(db.clone())),
            Arc::new(queue),
            max_upload_size,
        );
        Harness { service, db, rx, _dir: dir }
    }

    fn upload(filename: &str, data: &[u8]) -> Upload {
        Upload {
            space_id: "s".into(),
            filename: filename.into(),
            content_type: None,
            title: None,
            tags: vec![],
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_empty_upload_rejected_without_record() {
        let h = harness(1024);
        let err = h.service.accept(upload("empty.txt", b"")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.db.list_documents(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_and_unsupported_rejected() {
        let h = harness(4);
        assert!(matches!(
            h.service.accept(upload("big.txt", b"12345")).await,
            Err(Error::Validation(_))
        ));
        let h = harness(1024);
        assert!(matches!(
            h.service.accept(upload("archive.zip", b"PK")).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_returns_pending_and_queues() {
        let mut h = harness(1024);
        let mut up = upload("notes.md", b"# Notes");
        up.title = Some("My notes".into());
        let doc = h.service.accept(up).await.unwrap();

        assert_eq!(doc.processing_status, ProcessingStatus::Pending);
        assert_eq!(doc.mime_type, "text/markdown");
        assert_eq!(doc.display_name(), "My notes");
        assert_eq!(doc.content_hash.len(), 64);
        assert_eq!(h.rx.recv().await, Some(doc.id));

        match h.service.content(doc.id, 0, None).unwrap() {
            DocumentContent::NotReady { processing_status, .. } => {
                assert_eq!(processing_status, ProcessingStatus::Pending)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_content_pagination() {
        let h = harness(1024);
        let doc = h.service.accept(upload("a.txt", b"hello world")).await.unwrap();
        h.db.try_begin_processing(doc.id).unwrap();
        h.db.save_document_text(doc.id, "héllo world").unwrap();
        h.db.mark_completed(doc.id, 1).unwrap();

        match h.service.content(doc.id, 1, Some(4)).unwrap() {
            DocumentContent::Ready { text, total_chars, length, .. } => {
                assert_eq!(text, "éllo");
                assert_eq!(length, 4);
                assert_eq!(total_chars, 11);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reprocess_conflict_and_delete() {
        let h = harness(1024);
        let doc = h.service.accept(upload("a.txt", b"hello")).await.unwrap();
        h.db.try_begin_processing(doc.id).unwrap();
        assert!(matches!(h.service.reprocess(doc.id).await, Err(Error::Conflict(_))));

        h.db.mark_failed(doc.id, "x").unwrap();
        assert_eq!(h.service.reprocess(doc.id).await.unwrap().processing_status, ProcessingStatus::Pending);

        h.service.delete(doc.id).await.unwrap();
        assert!(matches!(h.service.get(doc.id), Err(Error::NotFound { .. })));
        assert!(matches!(h.service.delete(doc.id).await, Err(Error::NotFound { .. })));
    }
}
