//! Ranked, token-budgeted context for a conversation turn

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::ingestion::Embedder;
use crate::storage::Database;
use crate::types::Chunk;

use super::index::{ScoredChunk, VectorIndex};

/// What to retrieve
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalRequest {
    /// Limit to one space
    #[serde(default)]
    pub space_id: Option<String>,
    /// Explicitly attached documents; empty means the whole space
    #[serde(default)]
    pub document_ids: Vec<Uuid>,
    /// Free-text query for similarity search
    #[serde(default)]
    pub query: Option<String>,
    /// Token budget; the configured default when absent
    #[serde(default)]
    pub token_budget: Option<usize>,
}

/// One grounding chunk
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub document_id: Uuid,
    pub filename: String,
    pub chunk_index: usize,
    pub content: String,
    pub score: f32,
    pub tokens: usize,
}

/// Retrieved chunks, best first, within budget
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedContext {
    pub chunks: Vec<RetrievedChunk>,
    pub total_tokens: usize,
    pub token_budget: usize,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Selects grounding chunks from completed documents only
pub struct ContextRetriever {
    db: Database,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(
        db: Database,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            index,
            embedder,
            config,
        }
    }

    /// Estimated tokens for a text
    pub fn estimate_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.config.chars_per_token.max(1))
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievedContext> {
        let budget = request
            .token_budget
            .unwrap_or(self.config.default_token_budget);
        let explicit = !request.document_ids.is_empty();

        // documents that are not completed (or not in scope) simply contribute nothing
        let eligible = self
            .db
            .completed_document_ids(request.space_id.as_deref(), &request.document_ids)?;
        if explicit && eligible.len() < request.document_ids.len() {
            tracing::debug!(
                "{} of {} requested documents are not ready",
                request.document_ids.len() - eligible.len(),
                request.document_ids.len()
            );
        }

        let mut candidates: Vec<ScoredChunk> = Vec::new();
        let mut searchable = Vec::new();

        for id in eligible {
            let small = explicit
                && self
                    .db
                    .document_text_len(id)?
                    .is_some_and(|len| len <= self.config.small_document_chars);
            if small {
                candidates.extend(self.db.list_chunks(id)?.into_iter().map(|chunk| ScoredChunk {
                    chunk,
                    score: 1.0,
                }));
            } else {
                searchable.push(id);
            }
        }

        let query = request.query.as_deref().map(str::trim).filter(|q| !q.is_empty());
        if let (Some(query), false) = (query, searchable.is_empty()) {
            match self.embedder.embed(query).await {
                Ok(vector) => {
                    let hits = self
                        .index
                        .search(&vector, self.embedder.model_id(), &searchable, self.config.top_k)
                        .await?;
                    candidates.extend(hits);
                }
                Err(e) => tracing::warn!("Query embedding failed, skipping vector search: {}", e),
            }
        }

        // stable: whole small documents keep chunk order among equal scores
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut filenames: HashMap<Uuid, String> = HashMap::new();
        let mut context = RetrievedContext {
            token_budget: budget,
            ..Default::default()
        };

        for ScoredChunk { chunk, score } in candidates {
            let tokens = self.estimate_tokens(&chunk.content);
            if context.total_tokens + tokens > budget {
                break;
            }
            let filename = match filenames.get(&chunk.document_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .db
                        .get_document(chunk.document_id)?
                        .map(|d| d.display_name().to_string())
                        .unwrap_or_default();
                    filenames.insert(chunk.document_id, name.clone());
                    name
                }
            };
            context.total_tokens += tokens;
            context.chunks.push(into_retrieved(chunk, filename, score, tokens));
        }

        tracing::debug!(
            "Retrieved {} chunks ({} / {} tokens)",
            context.chunks.len(),
            context.total_tokens,
            budget
        );
        Ok(context)
    }
}

fn into_retrieved(chunk: Chunk, filename: String, score: f32, tokens: usize) -> RetrievedChunk {
    RetrievedChunk {
        document_id: chunk.document_id,
        filename,
        chunk_index: chunk.index,
        content: chunk.content,
        score,
        tokens,
    }
}
