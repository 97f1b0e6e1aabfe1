//! Core data types

pub mod chat;
pub mod conversation;
pub mod document;

pub use chat::Source;
pub use conversation::{BranchInfo, Conversation, Message, MessageStatus, Role};
pub use document::{Chunk, Document, FileKind, ProcessingStatus};
