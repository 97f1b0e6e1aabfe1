//! Storage for the original bytes of uploaded documents

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Raw document storage, keyed by document id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return the storage reference
    async fn put(&self, doc_id: &Uuid, filename: &str, data: &[u8]) -> Result<String>;

    async fn get(&self, doc_id: &Uuid) -> Result<Vec<u8>>;

    async fn exists(&self, doc_id: &Uuid) -> Result<bool>;

    /// Delete stored bytes; missing blobs are not an error
    async fn delete(&self, doc_id: &Uuid) -> Result<()>;

    fn name(&self) -> &str;
}

/// Filesystem store: `{id}.bin` plus a `{id}.meta.json` sidecar
pub struct LocalBlobStore {
    storage_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct BlobMeta {
    id: Uuid,
    filename: String,
    size: u64,
}

impl LocalBlobStore {
    pub fn new(storage_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self { storage_dir })
    }

    fn blob_path(&self, doc_id: &Uuid) -> PathBuf {
        self.storage_dir.join(format!("{}.bin", doc_id))
    }

    fn meta_path(&self, doc_id: &Uuid) -> PathBuf {
        self.storage_dir.join(format!("{}.meta.json", doc_id))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, doc_id: &Uuid, filename: &str, data: &[u8]) -> Result<String> {
        tokio::fs::write(self.blob_path(doc_id), data).await?;

        let meta = BlobMeta {
            id: *doc_id,
            filename: filename.to_string(),
            size: data.len() as u64,
        };
        tokio::fs::write(self.meta_path(doc_id), serde_json::to_string_pretty(&meta)?).await?;

        Ok(doc_id.to_string())
    }

    async fn get(&self, doc_id: &Uuid) -> Result<Vec<u8>> {
        tokio::fs::read(self.blob_path(doc_id))
            .await
            .map_err(|e| Error::internal(format!("Failed to read stored bytes of {}: {}", doc_id, e)))
    }

    async fn exists(&self, doc_id: &Uuid) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(doc_id)).await?)
    }

    async fn delete(&self, doc_id: &Uuid) -> Result<()> {
        for path in [self.blob_path(doc_id), self.meta_path(doc_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}
