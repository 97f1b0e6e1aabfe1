//! Persistent conversation store with per-conversation write serialization

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::Database;
use crate::types::{BranchInfo, Conversation, Message};

use super::tree::{ConversationTree, MessageDraft};

type Slot = Arc<Mutex<Option<ConversationTree>>>;

/// Loads conversation trees on demand and writes every mutation through to the database.
///
/// Mutations run on a copy of the tree; the copy replaces the cached tree only
/// after its changes are committed, so a rejected operation leaves no trace.
pub struct ConversationStore {
    db: Database,
    slots: DashMap<Uuid, Slot>,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            slots: DashMap::new(),
        }
    }

    pub async fn create(&self, space_id: Option<String>, title: impl Into<String>) -> Result<Conversation> {
        let conversation = Conversation::new(space_id, title);
        self.db.save_conversation(&conversation, &[], &[])?;
        self.slots.insert(
            conversation.id,
            Arc::new(Mutex::new(Some(ConversationTree::new(conversation.clone())))),
        );
        tracing::debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub fn list(&self, space_id: Option<&str>) -> Result<Vec<Conversation>> {
        self.db.list_conversations(space_id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Conversation> {
        Ok(self.snapshot(id).await?.conversation().clone())
    }

    /// Copy of the current tree for reading
    pub async fn snapshot(&self, id: Uuid) -> Result<ConversationTree> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        Ok(self.loaded(id, &mut guard)?.clone())
    }

    pub async fn branches(&self, id: Uuid) -> Result<Vec<BranchInfo>> {
        Ok(self.snapshot(id).await?.branches())
    }

    pub async fn rename(&self, id: Uuid, title: String) -> Result<Conversation> {
        self.mutate(id, |tree| {
            tree.rename(title);
            Ok(tree.conversation().clone())
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        if !self.db.delete_conversation(id)? {
            self.slots.remove(&id);
            return Err(Error::not_found("conversation", id));
        }
        *guard = None;
        self.slots.remove(&id);
        tracing::info!("Deleted conversation {}", id);
        Ok(())
    }

    pub async fn append(&self, id: Uuid, parent: Option<Uuid>, draft: MessageDraft) -> Result<Message> {
        self.mutate(id, |tree| tree.append(parent, draft)).await
    }

    /// Look a message up by id alone
    pub async fn find_message(&self, message_id: Uuid) -> Result<(Uuid, Message)> {
        let conversation_id = self
            .db
            .message_conversation(message_id)?
            .ok_or_else(|| Error::not_found("message", message_id))?;
        let message = self
            .snapshot(conversation_id)
            .await?
            .get(message_id)
            .cloned()
            .ok_or_else(|| Error::not_found("message", message_id))?;
        Ok((conversation_id, message))
    }

    /// Regenerate a message wherever it lives; returns its conversation id and the new sibling
    pub async fn regenerate(&self, message_id: Uuid) -> Result<(Uuid, Message)> {
        let conversation_id = self
            .db
            .message_conversation(message_id)?
            .ok_or_else(|| Error::not_found("message", message_id))?;
        let message = self
            .mutate(conversation_id, |tree| tree.regenerate(message_id))
            .await?;
        Ok((conversation_id, message))
    }

    pub async fn switch_branch(&self, id: Uuid, message_id: Uuid) -> Result<Uuid> {
        self.mutate(id, |tree| tree.switch_to(message_id)).await
    }

    pub async fn delete_branch(&self, id: Uuid, branch_id: Uuid) -> Result<usize> {
        self.mutate(id, |tree| tree.delete_branch(branch_id)).await
    }

    pub async fn merge_branch(&self, id: Uuid, source_branch: Uuid, target_message: Uuid) -> Result<Uuid> {
        if let Some(owner) = self.db.message_conversation(target_message)? {
            if owner != id {
                return Err(Error::validation(format!(
                    "Message {} belongs to a different conversation",
                    target_message
                )));
            }
        }
        self.mutate(id, |tree| tree.merge(source_branch, target_message)).await
    }

    /// Rewrite one message, e.g. to record generated output
    pub async fn update_message<F>(&self, id: Uuid, message_id: Uuid, update: F) -> Result<Message>
    where
        F: FnOnce(&mut Message),
    {
        self.mutate(id, |tree| tree.update_message(message_id, update)).await
    }

    /// Run `op` on a copy of the tree and commit it atomically
    async fn mutate<T, F>(&self, id: Uuid, op: F) -> Result<T>
    where
        F: FnOnce(&mut ConversationTree) -> Result<T>,
    {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        let mut tree = self.loaded(id, &mut guard)?.clone();

        let out = op(&mut tree)?;
        let changes = tree.take_changes();
        self.db
            .save_conversation(tree.conversation(), &changes.upserts, &changes.deletes)?;

        *guard = Some(tree);
        Ok(out)
    }

    fn slot(&self, id: Uuid) -> Slot {
        self.slots.entry(id).or_default().clone()
    }

    fn loaded<'a>(
        &self,
        id: Uuid,
        guard: &'a mut Option<ConversationTree>,
    ) -> Result<&'a mut ConversationTree> {
        if guard.is_none() {
            let conversation = match self.db.get_conversation(id)? {
                Some(c) => c,
                None => {
                    self.slots.remove(&id);
                    return Err(Error::not_found("conversation", id));
                }
            };
            let messages = self.db.list_messages(id)?;
            *guard = Some(ConversationTree::load(conversation, messages));
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::internal("conversation tree missing after load"))
    }
}
