//! Conversation, message and branch types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Persistence state of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    /// Assistant reply still being generated
    Streaming,
    /// Generation failed or was cancelled; content holds the partial output
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Streaming => "streaming",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "streaming" => Self::Streaming,
            "error" => Self::Error,
            _ => Self::Complete,
        }
    }
}

/// A conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub space_id: Option<String>,
    pub title: String,
    /// Leaf of the path currently shown to the user
    pub active_leaf_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(space_id: Option<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            space_id,
            title: title.into(),
            active_leaf_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A node of the conversation tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// None only for the first message of a conversation
    pub parent_id: Option<Uuid>,
    pub branch_id: Uuid,
    pub role: Role,
    pub content: String,
    pub document_ids: Vec<Uuid>,
    /// Images sent with a user message, as `data:` URLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Model that produced an assistant message
    pub model: Option<String>,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        branch_id: Uuid,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            parent_id,
            branch_id,
            role,
            content: content.into(),
            document_ids: Vec::new(),
            images: Vec::new(),
            model: None,
            status: MessageStatus::Complete,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Summary of one branch of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchInfo {
    pub branch_id: Uuid,
    /// Message the branch hangs off (None for the root branch)
    pub parent_id: Option<Uuid>,
    /// First message of the branch
    pub head_id: Uuid,
    /// Last message of the branch
    pub leaf_id: Uuid,
    pub message_count: usize,
    /// Whether the branch lies on the active path
    pub active: bool,
}
