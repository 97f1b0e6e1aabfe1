//! Extract → chunk → embed → index for one document

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ingestion::{Embedder, Extractor, TextChunker};
use crate::retrieval::VectorIndex;
use crate::storage::{BlobStore, Database};

use super::queue::{IngestQueue, IngestStage};

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed { chunks: usize },
    Failed(String),
    /// Another worker holds the document, or it is no longer pending
    Skipped,
}

/// Drives one document through ingestion and its status machine
pub struct IngestPipeline {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    extractor: Extractor,
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    queue: Arc<IngestQueue>,
}

impl IngestPipeline {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        extractor: Extractor,
        chunker: TextChunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        queue: Arc<IngestQueue>,
    ) -> Self {
        Self {
            db,
            blobs,
            extractor,
            chunker,
            embedder,
            index,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.queue
    }

    /// Claim and ingest a document; failures are recorded on the document, never returned
    pub async fn process(&self, document_id: Uuid) -> IngestOutcome {
        match self.db.try_begin_processing(document_id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Document {} is not pending, skipping", document_id);
                self.queue.mark_skipped(document_id);
                return IngestOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!("Failed to claim document {}: {}", document_id, e);
                self.queue.mark_skipped(document_id);
                return IngestOutcome::Skipped;
            }
        }

        self.queue.mark_started(document_id);
        let start = std::time::Instant::now();

        match self.run(document_id).await {
            Ok(chunks) => {
                if let Err(e) = self.db.mark_completed(document_id, chunks) {
                    tracing::error!("Failed to mark document {} completed: {}", document_id, e);
                }
                self.queue.mark_finished(document_id, None);
                tracing::info!(
                    "Ingested document {}: {} chunks in {:.1}s",
                    document_id,
                    chunks,
                    start.elapsed().as_secs_f64()
                );
                IngestOutcome::Completed { chunks }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("Ingestion of document {} failed: {}", document_id, message);
                if let Err(db_err) = self.db.mark_failed(document_id, &message) {
                    tracing::error!("Failed to record failure of {}: {}", document_id, db_err);
                }
                self.queue.mark_finished(document_id, Some(message.clone()));
                IngestOutcome::Failed(message)
            }
        }
    }

    async fn run(&self, document_id: Uuid) -> Result<usize> {
        let doc = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| Error::not_found("document", document_id))?;

        let data = self.blobs.get(&doc.id).await?;
        let text = self.extractor.extract(&doc.filename, &doc.mime_type, data).await?;
        self.db.save_document_text(doc.id, &text)?;

        self.queue.update_stage(doc.id, IngestStage::Chunking);
        let chunks = self.chunker.chunk(doc.id, &text);
        tracing::debug!("{}: {} chunks from {} chars", doc.filename, chunks.len(), text.chars().count());

        self.queue.update_stage(doc.id, IngestStage::Embedding);
        self.queue.set_total_chunks(doc.id, chunks.len());
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = self.embedder.embed(&chunk.content).await.map_err(|e| {
                Error::embedding(format!(
                    "chunk {} of {} failed: {}",
                    chunk.index + 1,
                    chunks.len(),
                    e
                ))
            })?;
            vectors.push(vector);
            self.queue.increment_chunks_embedded(doc.id);
        }

        self.queue.update_stage(doc.id, IngestStage::Storing);
        self.index
            .replace_document(doc.id, &chunks, &vectors, self.embedder.model_id())
            .await?;

        Ok(chunks.len())
    }
}
