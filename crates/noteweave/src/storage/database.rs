//! SQLite database for documents, chunks, embeddings and conversations
//!
//! A single connection behind a mutex; every multi-row change runs in one transaction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    Chunk, Conversation, Document, Message, MessageStatus, ProcessingStatus, Role,
};

/// Chunk plus its stored vector, as loaded for similarity search
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Document counts per processing status
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DocumentStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// SQLite-backed store
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (tests and throwaway servers)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                space_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                title TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                mime_type TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                storage_ref TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                processing_status TEXT NOT NULL,
                error TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_space ON documents(space_id);
            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(processing_status);

            CREATE TABLE IF NOT EXISTS document_text (
                document_id TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                char_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                char_start INTEGER NOT NULL,
                char_end INTEGER NOT NULL,
                overlap INTEGER NOT NULL,
                content TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
                document_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                vector BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                space_id TEXT,
                title TEXT NOT NULL,
                active_leaf_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                parent_id TEXT,
                branch_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                document_ids TEXT NOT NULL DEFAULT '[]',
                model TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                images TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
        "#,
        )
        .map_err(|e| Error::database(format!("Failed to run migrations: {}", e)))?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    // ==================== Document Operations ====================

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO documents (
                id, space_id, filename, title, tags, mime_type, byte_size, storage_ref,
                content_hash, processing_status, error, chunk_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                doc.id.to_string(),
                doc.space_id,
                doc.filename,
                doc.title,
                serde_json::to_string(&doc.tags)?,
                doc.mime_type,
                doc.byte_size as i64,
                doc.storage_ref,
                doc.content_hash,
                doc.processing_status.as_str(),
                doc.error,
                doc.chunk_count as i64,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::database(format!("Failed to insert document: {}", e)))?;
        Ok(())
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let doc = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id.to_string()],
                row_to_document,
            )
            .optional()
            .map_err(|e| Error::database(format!("Failed to get document: {}", e)))?;
        Ok(doc)
    }

    /// Documents of a space (all spaces when None), newest first
    pub fn list_documents(&self, space_id: Option<&str>) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM documents WHERE ?1 IS NULL OR space_id = ?1 ORDER BY created_at DESC",
        )?;
        let docs = stmt
            .query_map(params![space_id], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// Ids of completed documents, restricted to a space and/or an explicit set
    pub fn completed_document_ids(&self, space_id: Option<&str>, only: &[Uuid]) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM documents WHERE processing_status = 'completed' AND (?1 IS NULL OR space_id = ?1)",
        )?;
        let ids = stmt
            .query_map(params![space_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .filter(|id| only.is_empty() || only.contains(id))
            .collect();
        Ok(ids)
    }

    /// Atomically move a pending document to `processing`
    ///
    /// Returns false when another worker already holds it or it is not pending.
    pub fn try_begin_processing(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE documents SET processing_status = 'processing', error = NULL, updated_at = ?2
                 WHERE id = ?1 AND processing_status = 'pending'",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::database(format!("Failed to claim document: {}", e)))?;
        Ok(changed == 1)
    }

    /// Put a document back to `pending` for re-ingestion; Conflict while it is processing
    pub fn reset_for_reprocess(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET processing_status = 'pending', error = NULL, updated_at = ?2
             WHERE id = ?1 AND processing_status != 'processing'",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let exists: Option<String> = conn
            .query_row(
                "SELECT processing_status FROM documents WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(Error::conflict(format!("Document {} is already being processed", id))),
            None => Err(Error::not_found("document", id)),
        }
    }

    pub fn mark_completed(&self, id: Uuid, chunk_count: usize) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET processing_status = 'completed', error = NULL, chunk_count = ?2, updated_at = ?3
             WHERE id = ?1 AND processing_status = 'processing'",
            params![id.to_string(), chunk_count as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET processing_status = 'failed', error = ?2, updated_at = ?3
             WHERE id = ?1 AND processing_status = 'processing'",
            params![id.to_string(), error, Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Reset documents orphaned in `processing` by a previous run and return every pending id
    pub fn recover_interrupted(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let reset = conn.execute(
            "UPDATE documents SET processing_status = 'pending', updated_at = ?1
             WHERE processing_status = 'processing'",
            params![Utc::now().to_rfc3339()],
        )?;
        if reset > 0 {
            tracing::warn!("Reset {} documents interrupted during processing", reset);
        }

        let mut stmt = conn.prepare(
            "SELECT id FROM documents WHERE processing_status = 'pending' ORDER BY created_at",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    /// Delete a document; chunks, embeddings and text go with it
    pub fn delete_document(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::database(format!("Failed to delete document: {}", e)))?;
        Ok(count > 0)
    }

    pub fn document_stats(&self) -> Result<DocumentStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT processing_status, COUNT(*) FROM documents GROUP BY processing_status",
        )?;
        let mut stats = DocumentStats::default();
        for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
            let (status, count) = row?;
            let count = count as usize;
            match ProcessingStatus::parse(&status) {
                ProcessingStatus::Pending => stats.pending = count,
                ProcessingStatus::Processing => stats.processing = count,
                ProcessingStatus::Completed => stats.completed = count,
                ProcessingStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    // ==================== Extracted Text ====================

    pub fn save_document_text(&self, id: Uuid, text: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO document_text (document_id, content, char_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id) DO UPDATE SET content = excluded.content, char_count = excluded.char_count",
            params![id.to_string(), text, text.chars().count() as i64],
        )
        .map_err(|e| Error::database(format!("Failed to save document text: {}", e)))?;
        Ok(())
    }

    pub fn get_document_text(&self, id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let text = conn
            .query_row(
                "SELECT content FROM document_text WHERE document_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }

    /// Character length of the extracted text
    pub fn document_text_len(&self, id: Uuid) -> Result<Option<usize>> {
        let conn = self.conn.lock();
        let len: Option<i64> = conn
            .query_row(
                "SELECT char_count FROM document_text WHERE document_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(len.map(|l| l as usize))
    }

    // ==================== Chunks & Embeddings ====================

    /// Replace a document's chunk and embedding set in one transaction
    pub fn replace_document_chunks(
        &self,
        document_id: Uuid,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model_id: &str,
    ) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(Error::internal(format!(
                "{} chunks but {} vectors for document {}",
                chunks.len(),
                vectors.len(),
                document_id
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;

        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (id, document_id, chunk_index, char_start, char_end, overlap, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut insert_vector = tx.prepare(
                "INSERT INTO embeddings (chunk_id, document_id, model_id, dimensions, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for (chunk, vector) in chunks.iter().zip(vectors) {
                insert_chunk.execute(params![
                    chunk.id.to_string(),
                    chunk.document_id.to_string(),
                    chunk.index as i64,
                    chunk.char_start as i64,
                    chunk.char_end as i64,
                    chunk.overlap as i64,
                    chunk.content,
                ])?;
                insert_vector.execute(params![
                    chunk.id.to_string(),
                    chunk.document_id.to_string(),
                    model_id,
                    vector.len() as i64,
                    encode_vector(vector),
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    /// Chunks of a document in order
    pub fn list_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, document_id, chunk_index, char_start, char_end, overlap, content
             FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
        )?;
        let chunks = stmt
            .query_map(params![document_id.to_string()], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// Every stored vector produced by `model_id`, with its chunk
    pub fn load_embeddings(&self, model_id: &str) -> Result<Vec<StoredEmbedding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.document_id, c.chunk_index, c.char_start, c.char_end, c.overlap, c.content, e.vector
             FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
             WHERE e.model_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![model_id], |row| {
                Ok(StoredEmbedding {
                    chunk: row_to_chunk(row)?,
                    vector: decode_vector(&row.get::<_, Vec<u8>>(7)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop a document's chunks and their embeddings
    pub fn delete_chunks(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;
        Ok(count)
    }

    pub fn chunk_count(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==================== Conversations ====================

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        let conv = conn
            .query_row(
                "SELECT id, space_id, title, active_leaf_id, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .optional()?;
        Ok(conv)
    }

    pub fn list_conversations(&self, space_id: Option<&str>) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, space_id, title, active_leaf_id, created_at, updated_at
             FROM conversations WHERE ?1 IS NULL OR space_id = ?1 ORDER BY updated_at DESC",
        )?;
        let convs = stmt
            .query_map(params![space_id], row_to_conversation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(convs)
    }

    pub fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id.to_string()])?;
        Ok(count > 0)
    }

    /// Conversation owning a message
    pub fn message_conversation(&self, message_id: Uuid) -> Result<Option<Uuid>> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// Messages of a conversation in insertion order
    pub fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, parent_id, branch_id, role, content, document_ids, model, status, error, created_at, images
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at, rowid",
        )?;
        let messages = stmt
            .query_map(params![conversation_id.to_string()], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Write a conversation and a batch of message changes atomically
    pub fn save_conversation(
        &self,
        conversation: &Conversation,
        upserts: &[Message],
        deletes: &[Uuid],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "INSERT INTO conversations (id, space_id, title, active_leaf_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                active_leaf_id = excluded.active_leaf_id,
                updated_at = excluded.updated_at",
            params![
                conversation.id.to_string(),
                conversation.space_id,
                conversation.title,
                conversation.active_leaf_id.map(|id| id.to_string()),
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;

        {
            let mut delete = tx.prepare("DELETE FROM messages WHERE id = ?1")?;
            for id in deletes {
                delete.execute(params![id.to_string()])?;
            }

            let mut upsert = tx.prepare(
                "INSERT INTO messages (id, conversation_id, parent_id, branch_id, role, content, document_ids, model, status, error, created_at, images)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    branch_id = excluded.branch_id,
                    content = excluded.content,
                    model = excluded.model,
                    status = excluded.status,
                    error = excluded.error",
            )?;
            for m in upserts {
                upsert.execute(params![
                    m.id.to_string(),
                    m.conversation_id.to_string(),
                    m.parent_id.map(|id| id.to_string()),
                    m.branch_id.to_string(),
                    m.role.as_str(),
                    m.content,
                    serde_json::to_string(&m.document_ids)?,
                    m.model,
                    m.status.as_str(),
                    m.error,
                    m.created_at.to_rfc3339(),
                    serde_json::to_string(&m.images)?,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }
}

// ==================== Helper Functions ====================

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_uuid(s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let tags: String = row.get("tags")?;
    Ok(Document {
        id: parse_uuid(&row.get::<_, String>("id")?)?,
        space_id: row.get("space_id")?,
        filename: row.get("filename")?,
        title: row.get("title")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        mime_type: row.get("mime_type")?,
        byte_size: row.get::<_, i64>("byte_size")? as u64,
        storage_ref: row.get("storage_ref")?,
        content_hash: row.get("content_hash")?,
        processing_status: ProcessingStatus::parse(&row.get::<_, String>("processing_status")?),
        error: row.get("error")?,
        chunk_count: row.get::<_, i64>("chunk_count")? as usize,
        created_at: parse_time(&row.get::<_, String>("created_at")?),
        updated_at: parse_time(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        document_id: parse_uuid(&row.get::<_, String>(1)?)?,
        index: row.get::<_, i64>(2)? as usize,
        char_start: row.get::<_, i64>(3)? as usize,
        char_end: row.get::<_, i64>(4)? as usize,
        overlap: row.get::<_, i64>(5)? as usize,
        content: row.get(6)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        space_id: row.get(1)?,
        title: row.get(2)?,
        active_leaf_id: parse_opt_uuid(row.get(3)?)?,
        created_at: parse_time(&row.get::<_, String>(4)?),
        updated_at: parse_time(&row.get::<_, String>(5)?),
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let document_ids: String = row.get(6)?;
    let images: String = row.get(11)?;
    Ok(Message {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        conversation_id: parse_uuid(&row.get::<_, String>(1)?)?,
        parent_id: parse_opt_uuid(row.get(2)?)?,
        branch_id: parse_uuid(&row.get::<_, String>(3)?)?,
        role: Role::parse(&row.get::<_, String>(4)?).unwrap_or(Role::User),
        content: row.get(5)?,
        document_ids: serde_json::from_str(&document_ids).unwrap_or_default(),
        images: serde_json::from_str(&images).unwrap_or_default(),
        model: row.get(7)?,
        status: MessageStatus::parse(&row.get::<_, String>(8)?),
        error: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?),
    })
}
