//! Prompt assembly: grounding context plus the conversation path

use crate::providers::{ChatMessage, InlineImage};
use crate::retrieval::RetrievedContext;
use crate::types::{Message, MessageStatus, Role, Source};

/// Prompt builder for grounded chat turns
pub struct PromptBuilder;

impl PromptBuilder {
    /// Numbered context block, one entry per retrieved chunk
    pub fn build_context(context: &RetrievedContext) -> String {
        let mut out = String::new();

        for (i, chunk) in context.chunks.iter().enumerate() {
            out.push_str(&format!(
                "[{}] {}, Chunk {}\n\nContent:\n{}\n\n---\n\n",
                i + 1,
                chunk.filename,
                chunk.chunk_index + 1,
                chunk.content
            ));
        }

        out
    }

    /// Citation list matching the `[n]` markers of `build_context`
    pub fn sources(context: &RetrievedContext) -> Vec<Source> {
        context
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| Source {
                index: i + 1,
                document_id: c.document_id,
                filename: c.filename.clone(),
                chunk_index: c.chunk_index,
                score: c.score,
            })
            .collect()
    }

    /// System message: configured prompt, caller's instructions, then grounding context
    pub fn system_message(system_prompt: &str, extra: &[String], context: &RetrievedContext) -> String {
        let mut message = system_prompt.trim().to_string();

        for instruction in extra.iter().filter(|s| !s.trim().is_empty()) {
            message.push_str("\n\n");
            message.push_str(instruction.trim());
        }

        if !context.is_empty() {
            message.push_str(
                "\n\nCONTEXT FROM DOCUMENTS:\n\
                 Cite the numbered sources inline as [n]. Use only what they state.\n\n",
            );
            message.push_str(&Self::build_context(context));
        }

        message
    }

    /// System message followed by the conversation path; `images` go on the final user message
    /// System message plus the path; images of the last user message go along with it
    pub fn build_messages(system: String, path: &[&Message]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system)];

        for message in path {
            // Failed replies carry partial output; leave them out of the prompt
            if message.role == Role::Assistant && message.status != MessageStatus::Complete {
                continue;
            }
            if message.content.is_empty() && message.role != Role::User {
                continue;
            }
            messages.push(ChatMessage::new(message.role, message.content.clone()));
        }

        let images = path
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| Self::images_of(m))
            .unwrap_or_default();
        if !images.is_empty() {
            if let Some(last) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
                last.images = images;
            }
        }

        messages
    }

    /// Stored images of a message; unparseable entries are dropped
    pub fn images_of(message: &Message) -> Vec<InlineImage> {
        message
            .images
            .iter()
            .filter_map(|url| InlineImage::from_data_url(url))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RetrievedChunk;
    use uuid::Uuid;

    fn context() -> RetrievedContext {
        RetrievedContext {
            chunks: vec![
                RetrievedChunk {
                    document_id: Uuid::new_v4(),
                    filename: "a.pdf".into(),
                    chunk_index: 0,
                    content: "alpha".into(),
                    score: 0.9,
                    tokens: 2,
                },
                RetrievedChunk {
                    document_id: Uuid::new_v4(),
                    filename: "b.md".into(),
                    chunk_index: 3,
                    content: "beta".into(),
                    score: 0.5,
                    tokens: 1,
                },
            ],
            total_tokens: 3,
            token_budget: 100,
        }
    }

    #[test]
    fn test_context_numbering_matches_sources() {
        let ctx = context();
        let text = PromptBuilder::build_context(&ctx);
        assert!(text.starts_with("[1] a.pdf, Chunk 1"));
        assert!(text.contains("[2] b.md, Chunk 4"));

        let sources = PromptBuilder::sources(&ctx);
        assert_eq!(sources[1].index, 2);
        assert_eq!(sources[1].chunk_index, 3);
    }

    #[test]
    fn test_system_message_without_context() {
        let msg = PromptBuilder::system_message("Be brief.", &["Answer in French.".into()], &RetrievedContext::default());
        assert_eq!(msg, "Be brief.\n\nAnswer in French.");
    }

    #[test]
    fn test_build_messages_skips_failed_replies() {
        let conv = Uuid::new_v4();
        let branch = Uuid::new_v4();
        let q = Message::new(conv, None, branch, Role::User, "question");
        let mut failed = Message::new(conv, Some(q.id), branch, Role::Assistant, "partial");
        failed.status = MessageStatus::Error;
        let mut q2 = Message::new(conv, Some(failed.id), branch, Role::User, "again");
        q2.images = vec![InlineImage::from_bytes("image/png", b"png").data_url()];

        let messages = PromptBuilder::build_messages("sys".into(), &[&q, &failed, &q2]);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
        assert!(messages[1].images.is_empty());
        assert_eq!(messages[2].images.len(), 1);
    }
}
