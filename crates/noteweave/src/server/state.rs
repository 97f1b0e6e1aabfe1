//! Application state for the chat server

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::conversation::ConversationStore;
use crate::error::Result;
use crate::ingestion::{Embedder, Extractor, ProviderEmbedder, TextChunker};
use crate::processing::{DocumentService, IngestPipeline, IngestQueue, IngestionWorker};
use crate::providers::vision::VisionDescriber;
use crate::providers::{ModelSelector, ProviderRegistry};
use crate::retrieval::{ContextRetriever, SqliteVectorIndex, VectorIndex};
use crate::storage::{BlobStore, Database, LocalBlobStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    db: Database,
    registry: Arc<ProviderRegistry>,
    queue: Arc<IngestQueue>,
    documents: Arc<DocumentService>,
    retriever: Arc<ContextRetriever>,
    chat: Arc<ChatService>,
    ready: RwLock<bool>,
}

impl AppState {
    /// Build every component and start the ingestion worker
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Database::new(config.storage.database_path())?;
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.storage.blob_dir())?);
        let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
        Self::with_components(config, db, blobs, registry).await
    }

    /// Build around an existing database, blob store and provider registry
    pub async fn with_components(
        config: AppConfig,
        db: Database,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self> {
        tracing::info!("Initializing application state...");
        let selector = ModelSelector::new(registry.clone());

        let embedder: Arc<dyn Embedder> = Arc::new(ProviderEmbedder::new(
            &config.embeddings,
            &registry,
            config.ingestion.retry.clone(),
            Duration::from_secs(config.ingestion.embed_timeout_secs),
        ));
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(db.clone()));

        let extractor = Extractor::new(Duration::from_secs(config.ingestion.extract_timeout_secs))
            .with_describer(Arc::new(VisionDescriber::new(selector.clone(), config.chat.max_tokens)));
        let chunker = TextChunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap);

        let workers = config.ingestion.worker_count();
        let (queue, receiver) = IngestQueue::new(workers);
        let queue = Arc::new(queue);

        let pipeline = Arc::new(IngestPipeline::new(
            db.clone(),
            blobs.clone(),
            extractor,
            chunker,
            embedder.clone(),
            index.clone(),
            queue.clone(),
        ));
        tokio::spawn(IngestionWorker::new(pipeline, workers).run(receiver));

        let documents = Arc::new(DocumentService::new(
            db.clone(),
            blobs,
            index.clone(),
            queue.clone(),
            config.server.max_upload_size,
        ));
        let resumed = documents.resume_pending().await?;
        tracing::info!("Ingestion ready ({} workers, {} documents resumed)", workers, resumed);

        let retriever = Arc::new(ContextRetriever::new(
            db.clone(),
            index,
            embedder,
            config.retrieval.clone(),
        ));
        let conversations = Arc::new(ConversationStore::new(db.clone()));
        let chat = Arc::new(ChatService::new(
            conversations,
            retriever.clone(),
            selector,
            config.chat.clone(),
        ));

        let state = Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                registry,
                queue,
                documents,
                retriever,
                chat,
                ready: RwLock::new(false),
            }),
        };
        state.set_ready(true);
        Ok(state)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.inner.queue
    }

    pub fn documents(&self) -> &Arc<DocumentService> {
        &self.inner.documents
    }

    pub fn retriever(&self) -> &Arc<ContextRetriever> {
        &self.inner.retriever
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.inner.chat
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        self.inner.chat.conversations()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}
