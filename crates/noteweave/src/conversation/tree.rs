//! In-memory message tree of one conversation
//!
//! Messages are indexed by id, by parent (children in creation order) and by
//! branch. A branch is a chain: each message has at most one child on its own
//! branch, so every branch ends in exactly one leaf.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{BranchInfo, Conversation, Message, MessageStatus, Role};

/// Fields of a message about to be appended
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub document_ids: Vec<Uuid>,
    pub status: MessageStatus,
    /// `data:` URLs of attached images
    pub images: Vec<String>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>, document_ids: Vec<Uuid>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            document_ids,
            status: MessageStatus::Complete,
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Empty assistant reply that is still being generated
    pub fn assistant_placeholder(document_ids: Vec<Uuid>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            document_ids,
            status: MessageStatus::Streaming,
            images: Vec::new(),
        }
    }
}

/// Messages written or removed since the last `take_changes`
#[derive(Debug, Default)]
pub struct TreeChanges {
    pub upserts: Vec<Message>,
    pub deletes: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ConversationTree {
    conversation: Conversation,
    messages: HashMap<Uuid, Message>,
    children: HashMap<Uuid, Vec<Uuid>>,
    branches: HashMap<Uuid, Vec<Uuid>>,
    root: Option<Uuid>,
    dirty: HashSet<Uuid>,
    removed: Vec<Uuid>,
}

impl ConversationTree {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: HashMap::new(),
            children: HashMap::new(),
            branches: HashMap::new(),
            root: None,
            dirty: HashSet::new(),
            removed: Vec::new(),
        }
    }

    /// Rebuild the indexes from stored messages (in creation order)
    pub fn load(conversation: Conversation, messages: Vec<Message>) -> Self {
        let mut tree = Self::new(conversation);
        for message in &messages {
            tree.messages.insert(message.id, message.clone());
        }
        for message in messages {
            tree.branches.entry(message.branch_id).or_default().push(message.id);
            match message.parent_id {
                Some(parent) if tree.messages.contains_key(&parent) => {
                    tree.children.entry(parent).or_default().push(message.id);
                }
                Some(parent) => {
                    tracing::warn!("Message {} points at missing parent {}", message.id, parent);
                }
                None => {
                    if tree.root.is_none() {
                        tree.root = Some(message.id);
                    }
                }
            }
        }

        let leaf_valid = tree
            .conversation
            .active_leaf_id
            .is_some_and(|id| tree.messages.contains_key(&id));
        if !leaf_valid {
            tree.conversation.active_leaf_id = tree.root.map(|root| tree.extend_to_leaf(root));
        }
        tree
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn active_leaf(&self) -> Option<Uuid> {
        self.conversation.active_leaf_id
    }

    /// All messages ordered by creation time
    pub fn messages(&self) -> Vec<&Message> {
        let mut all: Vec<&Message> = self.messages.values().collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    /// Root to `leaf`, following parent pointers
    pub fn path_to(&self, leaf: Uuid) -> Vec<&Message> {
        let mut path = Vec::new();
        let mut cursor = self.messages.get(&leaf);
        while let Some(message) = cursor {
            path.push(message);
            cursor = message.parent_id.and_then(|p| self.messages.get(&p));
        }
        path.reverse();
        path
    }

    /// Messages currently shown to the user
    pub fn active_path(&self) -> Vec<&Message> {
        match self.conversation.active_leaf_id {
            Some(leaf) => self.path_to(leaf),
            None => Vec::new(),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.messages
            .keys()
            .filter(|id| self.children.get(id).map_or(true, |c| c.is_empty()))
            .count()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        let active: HashSet<Uuid> = self.active_path().iter().map(|m| m.id).collect();
        let mut infos: Vec<BranchInfo> = self
            .branches
            .iter()
            .filter_map(|(&branch_id, members)| {
                let head = self.branch_head(branch_id)?;
                let chain = self.branch_chain(head);
                let leaf = *chain.last()?;
                Some(BranchInfo {
                    branch_id,
                    parent_id: self.messages.get(&head).and_then(|m| m.parent_id),
                    head_id: head,
                    leaf_id: leaf,
                    message_count: members.len(),
                    active: active.contains(&head),
                })
            })
            .collect();
        infos.sort_by_key(|b| self.messages.get(&b.head_id).map(|m| m.created_at));
        infos
    }

    /// Append under `parent`, or under the active leaf when `parent` is None
    pub fn append(&mut self, parent: Option<Uuid>, draft: MessageDraft) -> Result<Message> {
        let parent = match parent {
            Some(id) if !self.contains(id) => return Err(Error::not_found("message", id)),
            Some(id) => Some(id),
            None => self.conversation.active_leaf_id,
        };

        let branch_id = match parent {
            Some(p) => {
                let parent_branch = self.messages[&p].branch_id;
                if self.child_on_branch(p, parent_branch).is_some() {
                    Uuid::new_v4()
                } else {
                    parent_branch
                }
            }
            None if self.root.is_some() => {
                return Err(Error::validation("Conversation already has a root message"))
            }
            None => Uuid::new_v4(),
        };

        let mut message = Message::new(self.conversation.id, parent, branch_id, draft.role, draft.content);
        message.document_ids = draft.document_ids;
        message.status = draft.status;
        message.images = draft.images;
        self.insert(message.clone());
        self.conversation.active_leaf_id = Some(message.id);
        self.touch();
        Ok(message)
    }

    /// New sibling of `message_id` on a fresh branch, made active
    pub fn regenerate(&mut self, message_id: Uuid) -> Result<Message> {
        let original = self
            .messages
            .get(&message_id)
            .ok_or_else(|| Error::not_found("message", message_id))?;
        let parent = original
            .parent_id
            .ok_or_else(|| Error::validation("The first message of a conversation cannot be regenerated"))?;

        let mut message = Message::new(self.conversation.id, Some(parent), Uuid::new_v4(), original.role, "");
        message.document_ids = original.document_ids.clone();
        message.status = MessageStatus::Streaming;
        self.insert(message.clone());
        self.conversation.active_leaf_id = Some(message.id);
        self.touch();
        Ok(message)
    }

    /// Make the path through `message_id` active, extended down its branch to a leaf
    pub fn switch_to(&mut self, message_id: Uuid) -> Result<Uuid> {
        if !self.contains(message_id) {
            return Err(Error::not_found("message", message_id));
        }
        let leaf = self.extend_to_leaf(message_id);
        self.conversation.active_leaf_id = Some(leaf);
        self.touch();
        Ok(leaf)
    }

    /// Remove a branch and everything below its first message
    pub fn delete_branch(&mut self, branch_id: Uuid) -> Result<usize> {
        let head = self
            .branch_head(branch_id)
            .ok_or_else(|| Error::not_found("branch", branch_id))?;
        let parent = self.messages[&head]
            .parent_id
            .ok_or_else(|| Error::validation("The root branch cannot be deleted; delete the conversation instead"))?;

        let subtree = self.subtree(head);
        let removed: HashSet<Uuid> = subtree.iter().copied().collect();
        for id in &subtree {
            self.remove(*id);
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|id| *id != head);
        }

        let active_removed = self
            .conversation
            .active_leaf_id
            .is_some_and(|leaf| removed.contains(&leaf));
        if active_removed {
            self.conversation.active_leaf_id = Some(self.extend_to_leaf(parent));
        }
        self.touch();
        Ok(subtree.len())
    }

    /// Reparent a branch onto `target_id`; the source branch id ceases to exist
    pub fn merge(&mut self, source_branch: Uuid, target_id: Uuid) -> Result<Uuid> {
        let head = self
            .branch_head(source_branch)
            .ok_or_else(|| Error::not_found("branch", source_branch))?;
        let target = self
            .messages
            .get(&target_id)
            .ok_or_else(|| Error::not_found("message", target_id))?;
        let old_parent = self.messages[&head]
            .parent_id
            .ok_or_else(|| Error::validation("The root branch cannot be merged"))?;
        if self.subtree(head).contains(&target_id) {
            return Err(Error::validation("Cannot merge a branch into its own descendants"));
        }

        let target_is_leaf = self.children.get(&target_id).map_or(true, |c| c.is_empty());
        let new_branch = if target_is_leaf {
            target.branch_id
        } else {
            Uuid::new_v4()
        };

        if let Some(siblings) = self.children.get_mut(&old_parent) {
            siblings.retain(|id| *id != head);
        }
        self.children.entry(target_id).or_default().push(head);

        let members = self.branches.remove(&source_branch).unwrap_or_default();
        for id in &members {
            if let Some(message) = self.messages.get_mut(id) {
                message.branch_id = new_branch;
                if *id == head {
                    message.parent_id = Some(target_id);
                }
                self.dirty.insert(*id);
            }
        }
        self.branches.entry(new_branch).or_default().extend(members);

        let leaf = self.extend_to_leaf(target_id);
        self.conversation.active_leaf_id = Some(leaf);
        self.touch();
        Ok(new_branch)
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        self.conversation.title = title.into();
        self.touch();
    }

    /// Apply `update` to one message
    pub fn update_message<F>(&mut self, message_id: Uuid, update: F) -> Result<Message>
    where
        F: FnOnce(&mut Message),
    {
        let message = self
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| Error::not_found("message", message_id))?;
        update(message);
        let updated = message.clone();
        self.dirty.insert(message_id);
        self.touch();
        Ok(updated)
    }

    /// Drain pending writes for persistence
    pub fn take_changes(&mut self) -> TreeChanges {
        let upserts = self
            .dirty
            .drain()
            .filter_map(|id| self.messages.get(&id).cloned())
            .collect();
        TreeChanges {
            upserts,
            deletes: std::mem::take(&mut self.removed),
        }
    }

    // ==================== Index helpers ====================

    fn insert(&mut self, message: Message) {
        let id = message.id;
        match message.parent_id {
            Some(parent) => self.children.entry(parent).or_default().push(id),
            None => self.root = Some(id),
        }
        self.branches.entry(message.branch_id).or_default().push(id);
        self.messages.insert(id, message);
        self.dirty.insert(id);
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(message) = self.messages.remove(&id) {
            if let Some(members) = self.branches.get_mut(&message.branch_id) {
                members.retain(|m| *m != id);
                if members.is_empty() {
                    self.branches.remove(&message.branch_id);
                }
            }
        }
        self.children.remove(&id);
        self.dirty.remove(&id);
        self.removed.push(id);
    }

    fn touch(&mut self) {
        self.conversation.updated_at = Utc::now();
    }

    fn child_on_branch(&self, parent: Uuid, branch_id: Uuid) -> Option<Uuid> {
        self.children
            .get(&parent)?
            .iter()
            .copied()
            .find(|c| self.messages.get(c).is_some_and(|m| m.branch_id == branch_id))
    }

    /// First message of a branch: its parent sits on another branch or it is the root
    fn branch_head(&self, branch_id: Uuid) -> Option<Uuid> {
        self.branches.get(&branch_id)?.iter().copied().find(|id| {
            self.messages[id]
                .parent_id
                .and_then(|p| self.messages.get(&p))
                .map_or(true, |parent| parent.branch_id != branch_id)
        })
    }

    fn branch_chain(&self, head: Uuid) -> Vec<Uuid> {
        let mut chain = vec![head];
        let mut cursor = head;
        while let Some(next) = self.child_on_branch(cursor, self.messages[&cursor].branch_id) {
            chain.push(next);
            cursor = next;
        }
        chain
    }

    /// Walk down the message's own branch, then oldest children, until a leaf
    fn extend_to_leaf(&self, from: Uuid) -> Uuid {
        let mut cursor = from;
        loop {
            let branch = self.messages[&cursor].branch_id;
            let next = self.child_on_branch(cursor, branch).or_else(|| {
                self.children.get(&cursor).and_then(|c| c.first().copied())
            });
            match next {
                Some(next) => cursor = next,
                None => return cursor,
            }
        }
    }

    fn subtree(&self, root: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ConversationTree {
        ConversationTree::new(Conversation::new(None, "test"))
    }

    fn user(text: &str) -> MessageDraft {
        MessageDraft::user(text, vec![])
    }

    fn reply() -> MessageDraft {
        MessageDraft::assistant_placeholder(vec![])
    }

    fn ids(path: Vec<&Message>) -> Vec<Uuid> {
        path.into_iter().map(|m| m.id).collect()
    }

    fn assert_invariant(t: &ConversationTree) {
        assert_eq!(t.leaf_count(), t.branch_count());
    }

    #[test]
    fn test_append_chains_on_one_branch() {
        let mut t = tree();
        let p = t.append(None, user("hi")).unwrap();
        let m = t.append(None, reply()).unwrap();
        assert_eq!(m.parent_id, Some(p.id));
        assert_eq!(m.branch_id, p.branch_id);
        assert_eq!(ids(t.active_path()), vec![p.id, m.id]);
        assert_invariant(&t);
    }

    #[test]
    fn test_second_root_rejected() {
        let mut t = tree();
        let root = t.append(None, user("hi")).unwrap();
        let mut fresh = t.clone();
        fresh.conversation.active_leaf_id = None;
        assert!(matches!(fresh.append(None, user("again")), Err(Error::Validation(_))));
        assert!(t.append(Some(Uuid::new_v4()), user("x")).is_err());
        assert_eq!(t.active_leaf(), Some(root.id));
    }

    #[test]
    fn test_regenerate_and_switch() {
        let mut t = tree();
        let p = t.append(None, user("question")).unwrap();
        let m = t.append(None, reply()).unwrap();

        let m2 = t.regenerate(m.id).unwrap();
        assert_eq!(m2.parent_id, Some(p.id));
        assert_ne!(m2.branch_id, m.branch_id);
        assert_eq!(m2.status, MessageStatus::Streaming);
        assert_eq!(ids(t.active_path()), vec![p.id, m2.id]);
        assert_invariant(&t);

        t.switch_to(m.id).unwrap();
        assert_eq!(ids(t.active_path()), vec![p.id, m.id]);
        t.switch_to(m2.id).unwrap();
        assert_eq!(ids(t.active_path()), vec![p.id, m2.id]);
        assert!(t.contains(m.id));
        assert_eq!(t.branches().len(), 2);
    }

    #[test]
    fn test_regenerate_root_rejected() {
        let mut t = tree();
        let p = t.append(None, user("question")).unwrap();
        assert!(matches!(t.regenerate(p.id), Err(Error::Validation(_))));
    }

    #[test]
    fn test_switch_extends_to_leaf() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let a = t.append(None, reply()).unwrap();
        let b = t.append(None, user("follow-up")).unwrap();
        t.regenerate(a.id).unwrap();

        assert_eq!(t.switch_to(p.id).unwrap(), b.id);
    }

    #[test]
    fn test_delete_branch_removes_subtree() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let m = t.append(None, reply()).unwrap();
        let m2 = t.regenerate(m.id).unwrap();
        let follow = t.append(None, user("more")).unwrap();
        t.take_changes();

        assert_eq!(t.delete_branch(m2.branch_id).unwrap(), 2);
        assert!(!t.contains(m2.id) && !t.contains(follow.id));
        assert_eq!(ids(t.active_path()), vec![p.id, m.id]);
        assert_invariant(&t);

        let changes = t.take_changes();
        assert_eq!(changes.deletes.len(), 2);
        assert!(matches!(t.delete_branch(m2.branch_id), Err(Error::NotFound { .. })));
        assert!(matches!(t.delete_branch(p.branch_id), Err(Error::Validation(_))));
    }

    #[test]
    fn test_merge_onto_leaf_adopts_branch() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let m = t.append(None, reply()).unwrap();
        let m2 = t.regenerate(m.id).unwrap();
        let old_branch = m2.branch_id;

        let merged = t.merge(old_branch, m.id).unwrap();
        assert_eq!(merged, m.branch_id);
        assert_eq!(t.get(m2.id).unwrap().parent_id, Some(m.id));
        assert!(t.branches().iter().all(|b| b.branch_id != old_branch));
        assert_eq!(ids(t.active_path()), vec![p.id, m.id, m2.id]);
        assert_invariant(&t);
    }

    #[test]
    fn test_merge_onto_inner_message_mints_branch() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let m = t.append(None, reply()).unwrap();
        t.append(None, user("more")).unwrap();
        let m2 = t.regenerate(m.id).unwrap();

        let merged = t.merge(m2.branch_id, m.id).unwrap();
        assert_ne!(merged, m2.branch_id);
        assert_ne!(merged, p.branch_id);
        assert_invariant(&t);
    }

    #[test]
    fn test_merge_rejections_leave_tree_untouched() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let m = t.append(None, reply()).unwrap();
        let m2 = t.regenerate(m.id).unwrap();
        let below = t.append(None, user("under m2")).unwrap();
        let before = t.branches();

        assert!(matches!(t.merge(m2.branch_id, below.id), Err(Error::Validation(_))));
        assert!(matches!(t.merge(p.branch_id, m2.id), Err(Error::Validation(_))));
        assert!(matches!(t.merge(Uuid::new_v4(), m.id), Err(Error::NotFound { .. })));
        assert!(matches!(t.merge(m2.branch_id, Uuid::new_v4()), Err(Error::NotFound { .. })));
        assert_eq!(t.branches(), before);
    }

    #[test]
    fn test_invariant_over_mixed_operations() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let a = t.append(None, reply()).unwrap();
        let b = t.regenerate(a.id).unwrap();
        t.append(None, user("on b")).unwrap();
        let c = t.regenerate(a.id).unwrap();
        t.switch_to(a.id).unwrap();
        t.append(None, user("on a")).unwrap();
        assert_invariant(&t);

        t.merge(c.branch_id, p.id).unwrap();
        assert_invariant(&t);
        t.delete_branch(b.branch_id).unwrap();
        assert_invariant(&t);
    }

    #[test]
    fn test_load_rebuilds_indexes() {
        let mut t = tree();
        let p = t.append(None, user("q")).unwrap();
        let m = t.append(None, reply()).unwrap();
        let m2 = t.regenerate(m.id).unwrap();
        t.switch_to(m.id).unwrap();

        let messages: Vec<Message> = t.messages().into_iter().cloned().collect();
        let loaded = ConversationTree::load(t.conversation().clone(), messages);
        assert_eq!(ids(loaded.active_path()), vec![p.id, m.id]);
        assert_eq!(loaded.branches().len(), 2);
        assert!(loaded.contains(m2.id));
    }
}
