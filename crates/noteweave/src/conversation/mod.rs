//! Branching conversations

mod store;
mod tree;

pub use store::ConversationStore;
pub use tree::{ConversationTree, MessageDraft, TreeChanges};
