//! Vector index gateway
//!
//! The [`VectorIndex`] trait hides the vector store from ingestion and retrieval. The
//! SQLite implementation keeps vectors in the database and an in-memory copy per
//! embedding model, loaded on first search and kept in step with every write.

use async_trait::async_trait;
use parking_lot::RwLock;
use simsimd::SpatialSimilarity;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{Database, StoredEmbedding};
use crate::types::Chunk;

/// A chunk with its similarity to the query
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity, higher is more similar
    pub score: f32,
}

/// Upsert and query (vector, chunk) pairs keyed by document and chunk index
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace every entry of a document with the given set
    async fn replace_document(
        &self,
        document_id: Uuid,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model_id: &str,
    ) -> Result<()>;

    /// Most similar chunks among `documents`, best first; only vectors of `model_id` are compared
    async fn search(
        &self,
        query: &[f32],
        model_id: &str,
        documents: &[Uuid],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Drop all entries of a document
    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize>;

    fn name(&self) -> &str;
}

type ModelCache = HashMap<Uuid, Vec<StoredEmbedding>>;

struct IndexInner {
    db: Database,
    /// model id -> document id -> entries
    cache: RwLock<HashMap<String, ModelCache>>,
}

/// Index stored in SQLite with an in-memory read cache
#[derive(Clone)]
pub struct SqliteVectorIndex {
    inner: Arc<IndexInner>,
}

impl SqliteVectorIndex {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(IndexInner {
                db,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IndexInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::internal(format!("Task join error: {}", e)))?
    }
}

impl IndexInner {
    fn ensure_loaded(&self, model_id: &str) -> Result<()> {
        if self.cache.read().contains_key(model_id) {
            return Ok(());
        }

        let mut cache = self.cache.write();
        if cache.contains_key(model_id) {
            return Ok(());
        }
        let mut by_document: ModelCache = HashMap::new();
        let entries = self.db.load_embeddings(model_id)?;
        let count = entries.len();
        for entry in entries {
            by_document.entry(entry.chunk.document_id).or_default().push(entry);
        }
        cache.insert(model_id.to_string(), by_document);
        tracing::info!("Loaded {} vectors for {}", count, model_id);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn replace_document(
        &self,
        document_id: Uuid,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model_id: &str,
    ) -> Result<()> {
        let chunks = chunks.to_vec();
        let vectors = vectors.to_vec();
        let model_id = model_id.to_string();

        self.blocking(move |inner| {
            // hold the write lock across the database write so a concurrent load cannot miss it
            let mut cache = inner.cache.write();
            inner.db.replace_document_chunks(document_id, &chunks, &vectors, &model_id)?;

            for by_document in cache.values_mut() {
                by_document.remove(&document_id);
            }
            if let Some(by_document) = cache.get_mut(&model_id) {
                let entries = chunks
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| StoredEmbedding { chunk, vector })
                    .collect();
                by_document.insert(document_id, entries);
            }
            Ok(())
        })
        .await
    }

    async fn search(
        &self,
        query: &[f32],
        model_id: &str,
        documents: &[Uuid],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if documents.is_empty() || top_k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let query = query.to_vec();
        let model_id = model_id.to_string();
        let documents = documents.to_vec();

        self.blocking(move |inner| {
            inner.ensure_loaded(&model_id)?;
            let cache = inner.cache.read();
            let Some(by_document) = cache.get(&model_id) else {
                return Ok(Vec::new());
            };

            let mut scored: Vec<ScoredChunk> = documents
                .iter()
                .filter_map(|id| by_document.get(id))
                .flatten()
                .filter_map(|entry| {
                    cosine_similarity(&query, &entry.vector).map(|score| ScoredChunk {
                        chunk: entry.chunk.clone(),
                        score,
                    })
                })
                .collect();

            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
            scored.truncate(top_k);
            Ok(scored)
        })
        .await
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize> {
        self.blocking(move |inner| {
            let mut cache = inner.cache.write();
            let removed = inner.db.delete_chunks(document_id)?;
            for by_document in cache.values_mut() {
                by_document.remove(&document_id);
            }
            Ok(removed)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite-simsimd"
    }
}

/// Cosine similarity in [-1, 1]; None when the dimensions differ
///
/// A zero vector has no direction and scores 0 against anything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    if a.iter().all(|x| *x == 0.0) || b.iter().all(|x| *x == 0.0) {
        return Some(0.0);
    }
    <f32 as SpatialSimilarity>::cos(a, b).map(|distance| (1.0 - distance) as f32)
}
