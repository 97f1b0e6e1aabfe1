//! noteweave: document-grounded chat with branching conversations
//!
//! Uploaded files are extracted, chunked, embedded and indexed in the background. Chat
//! requests retrieve the most relevant chunks from a space, ground the prompt in them and
//! stream the answer from whichever configured provider serves the requested model,
//! falling back to another provider when the first one is unavailable. Every turn is
//! stored in a conversation tree that supports regeneration, branch switching and merging.

pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use types::{
    chat::{ChatCompletionRequest, ChatCompletionResponse},
    conversation::{Conversation, Message},
    document::{Chunk, Document},
};
