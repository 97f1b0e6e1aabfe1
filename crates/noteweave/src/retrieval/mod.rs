//! Vector index gateway and context retrieval

mod index;
mod retriever;

pub use index::{cosine_similarity, ScoredChunk, SqliteVectorIndex, VectorIndex};
pub use retriever::{ContextRetriever, RetrievalRequest, RetrievedChunk, RetrievedContext};
