//! Background worker pool for document ingestion

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::pipeline::IngestPipeline;

/// Pulls document ids off the queue and ingests up to `workers` of them at a time
pub struct IngestionWorker {
    pipeline: Arc<IngestPipeline>,
    workers: usize,
}

impl IngestionWorker {
    pub fn new(pipeline: Arc<IngestPipeline>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
        }
    }

    /// Process queued documents until the queue's sender is dropped
    pub async fn run(self, mut receiver: mpsc::Receiver<Uuid>) {
        tracing::info!("Ingestion worker started: {} parallel documents", self.workers);
        let semaphore = Arc::new(Semaphore::new(self.workers));

        while let Some(document_id) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pipeline = self.pipeline.clone();

            tokio::spawn(async move {
                let _permit = permit;
                pipeline.process(document_id).await;
            });
        }

        tracing::info!("Ingestion worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::ingestion::{Embedder, Extractor, TextChunker};
    use crate::processing::pipeline::IngestOutcome;
    use crate::processing::queue::IngestQueue;
    use crate::retrieval::SqliteVectorIndex;
    use crate::storage::{BlobStore, Database, LocalBlobStore};
    use crate::types::{Document, ProcessingStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts calls and tracks how many embeddings run at once
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "test:count"
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_on.is_some_and(|needle| text.contains(needle)) {
                return Err(crate::error::Error::embedding("model refused"));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct Harness {
        db: Database,
        blobs: Arc<LocalBlobStore>,
        pipeline: Arc<IngestPipeline>,
        embedder: Arc<CountingEmbedder>,
        _dir: tempfile::TempDir,
    }

    fn harness(embedder: CountingEmbedder) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().to_path_buf()).unwrap());
        let embedder = Arc::new(embedder);
        let (queue, _rx) = IngestQueue::new(2);
        let pipeline = Arc::new(IngestPipeline::new(
            db.clone(),
            blobs.clone(),
            Extractor::new(Duration::from_secs(5)),
            TextChunker::new(100, 20),
            embedder.clone(),
            Arc::new(SqliteVectorIndex::new(db.clone())),
            Arc::new(queue),
        ));
        Harness { db, blobs, pipeline, embedder, _dir: dir }
    }

    async fn add_document(h: &Harness, mime: &str, data: &[u8]) -> Uuid {
        let doc = Document::pending("s", "doc", mime, data.len() as u64, "hash");
        h.blobs.put(&doc.id, "doc", data).await.unwrap();
        h.db.insert_document(&doc).unwrap();
        doc.id
    }

    #[tokio::test]
    async fn test_pipeline_completes_document() {
        let h = harness(CountingEmbedder::default());
        let id = add_document(&h, "text/plain", "word ".repeat(100).as_bytes()).await;

        let outcome = h.pipeline.process(id).await;
        let doc = h.db.get_document(id).unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Completed);
        assert_eq!(outcome, IngestOutcome::Completed { chunks: doc.chunk_count });
        assert_eq!(doc.chunk_count, TextChunker::new(100, 20).expected_count(500));
        assert_eq!(h.db.chunk_count(id).unwrap(), doc.chunk_count);
    }

    #[tokio::test]
    async fn test_reingestion_replaces_chunks() {
        let h = harness(CountingEmbedder::default());
        let id = add_document(&h, "text/plain", "word ".repeat(100).as_bytes()).await;
        h.pipeline.process(id).await;
        let first = h.db.load_embeddings("test:count").unwrap();

        h.db.reset_for_reprocess(id).unwrap();
        h.pipeline.process(id).await;
        let second = h.db.load_embeddings("test:count").unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(h.db.chunk_count(id).unwrap(), first.len());
        for a in &first {
            let b = second.iter().find(|e| e.chunk.id == a.chunk.id).unwrap();
            assert_eq!(a.vector, b.vector);
        }
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_bytes() {
        let h = harness(CountingEmbedder::default());
        let id = add_document(&h, "application/pdf", b"definitely not a pdf").await;

        let outcome = h.pipeline.process(id).await;
        assert!(matches!(outcome, IngestOutcome::Failed(_)));
        let doc = h.db.get_document(id).unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Failed);
        assert!(doc.error.is_some());
        assert!(h.blobs.exists(&id).await.unwrap());
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_document() {
        let h = harness(CountingEmbedder {
            fail_on: Some("poison"),
            ..Default::default()
        });
        let text = format!("{}poison", "clean ".repeat(40));
        let id = add_document(&h, "text/plain", text.as_bytes()).await;

        h.pipeline.process(id).await;
        let doc = h.db.get_document(id).unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Failed);
        assert!(doc.error.unwrap().contains("model refused"));
        assert_eq!(h.db.chunk_count(id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_process_once() {
        let h = harness(CountingEmbedder::default());
        let id = add_document(&h, "text/plain", b"a short note").await;

        let runs: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move { pipeline.process(id).await })
            })
            .collect();
        let mut completed = 0;
        for run in runs {
            if matches!(run.await.unwrap(), IngestOutcome::Completed { .. }) {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_bounds_concurrency() {
        let h = harness(CountingEmbedder::default());
        let (tx, rx) = mpsc::channel(16);
        let worker = IngestionWorker::new(h.pipeline.clone(), 2);
        let handle = tokio::spawn(worker.run(rx));

        let mut ids = Vec::new();
        for i in 0..6 {
            let id = add_document(&h, "text/plain", format!("document number {}", i).as_bytes()).await;
            ids.push(id);
            tx.send(id).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.db.document_stats().unwrap().completed == ids.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("documents did not complete");

        assert!(h.embedder.max_in_flight.load(Ordering::SeqCst) <= 2);
        drop(tx);
        handle.await.unwrap();
    }
}
