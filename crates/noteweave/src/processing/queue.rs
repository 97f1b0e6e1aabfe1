//! Queue of documents waiting for ingestion, with per-document progress

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Pipeline stage of one document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Queued,
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

/// Progress of one document through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestProgress {
    pub document_id: Uuid,
    pub stage: IngestStage,
    pub total_chunks: usize,
    pub chunks_embedded: usize,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IngestProgress {
    fn queued(document_id: Uuid) -> Self {
        Self {
            document_id,
            stage: IngestStage::Queued,
            total_chunks: 0,
            chunks_embedded: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Queue counters
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub workers: usize,
}

/// Hands document ids to the ingestion worker
pub struct IngestQueue {
    progress: Arc<DashMap<Uuid, IngestProgress>>,
    sender: mpsc::Sender<Uuid>,
    worker_count: usize,
    queue_size: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl IngestQueue {
    pub fn new(worker_count: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(1000);

        let queue = Self {
            progress: Arc::new(DashMap::new()),
            sender,
            worker_count,
            queue_size: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        };
        (queue, receiver)
    }

    /// Queue a pending document
    pub async fn submit(&self, document_id: Uuid) -> Result<()> {
        self.progress.insert(document_id, IngestProgress::queued(document_id));
        self.queue_size.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.sender.send(document_id).await {
            decrement(&self.queue_size);
            tracing::error!("Failed to queue document {}: {}", document_id, e);
            return Err(Error::internal("Ingestion worker is not running"));
        }
        tracing::debug!("Queued document {}", document_id);
        Ok(())
    }

    pub fn get_progress(&self, document_id: Uuid) -> Option<IngestProgress> {
        self.progress.get(&document_id).map(|p| p.clone())
    }

    pub fn forget(&self, document_id: Uuid) {
        self.progress.remove(&document_id);
    }

    /// A worker picked the document up
    pub fn mark_started(&self, document_id: Uuid) {
        decrement(&self.queue_size);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.update_stage(document_id, IngestStage::Extracting);
    }

    /// The worker found the document already claimed or gone
    pub fn mark_skipped(&self, document_id: Uuid) {
        decrement(&self.queue_size);
        self.progress.remove(&document_id);
    }

    pub fn update_stage(&self, document_id: Uuid, stage: IngestStage) {
        if let Some(mut p) = self.progress.get_mut(&document_id) {
            p.stage = stage;
            p.updated_at = Utc::now();
        }
    }

    pub fn set_total_chunks(&self, document_id: Uuid, total: usize) {
        if let Some(mut p) = self.progress.get_mut(&document_id) {
            p.total_chunks = total;
            p.chunks_embedded = 0;
            p.updated_at = Utc::now();
        }
    }

    pub fn increment_chunks_embedded(&self, document_id: Uuid) {
        if let Some(mut p) = self.progress.get_mut(&document_id) {
            p.chunks_embedded += 1;
            p.updated_at = Utc::now();
        }
    }

    pub fn mark_finished(&self, document_id: Uuid, error: Option<String>) {
        decrement(&self.active);
        let stage = if error.is_some() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            IngestStage::Failed
        } else {
            self.completed.fetch_add(1, Ordering::SeqCst);
            IngestStage::Completed
        };
        if let Some(mut p) = self.progress.get_mut(&document_id) {
            p.stage = stage;
            p.error = error;
            p.updated_at = Utc::now();
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queue_size.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            workers: self.worker_count,
        }
    }
}

/// Documents processed directly (not through `submit`) must not wrap the counters
fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
}
