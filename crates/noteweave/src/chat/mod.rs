//! Grounded chat: prompt assembly, completion and streaming

mod prompt;
mod service;
mod streaming;

pub use prompt::PromptBuilder;
pub use service::{ChatService, PreparedTurn, RegenerateRequest};
pub use streaming::StreamFrame;
