//! Persistent storage: SQLite for records, the filesystem for uploaded bytes

mod blob_store;
mod database;

pub use blob_store::{BlobStore, LocalBlobStore};
pub use database::{Database, DocumentStats, StoredEmbedding};
