//! Turning uploaded bytes into chunked, embedded text

mod chunker;
mod embedder;
mod extractor;

pub use chunker::TextChunker;
pub use embedder::{Embedder, ProviderEmbedder};
pub use extractor::Extractor;
