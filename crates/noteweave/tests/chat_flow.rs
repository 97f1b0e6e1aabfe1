//! End-to-end chat turns: grounding, regeneration, streaming failures, cancellation, fallback

mod common;

use common::{Harness, Script, ScriptedProvider};
use noteweave::chat::{RegenerateRequest, StreamFrame};
use noteweave::config::ProviderSettings;
use noteweave::error::{Error, ProviderErrorKind};
use noteweave::providers::openai::OpenAiCompatible;
use noteweave::providers::{ChatProvider, ProviderKind};
use noteweave::types::chat::{ChatCompletionRequest, MessageContent, RequestMessage};
use noteweave::types::{Message, MessageStatus, Role};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn ask(text: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        messages: vec![RequestMessage {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
        }],
        ..Default::default()
    }
}

async fn collect(mut rx: mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream stalled")
    {
        frames.push(frame);
    }
    frames
}

fn streamed_text(frames: &[StreamFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Chunk(chunk) => chunk.choices[0].delta.content.clone(),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attached_document_limits_context() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["Per [1], ", "yes."]));
    let harness = Harness::new(vec![provider]).await;

    let attached = harness
        .ingest("space-1", "apples.txt", "Apples are grown in orchards across the valley.")
        .await;
    let other = harness
        .ingest("space-1", "tides.txt", "Tides follow the moon and rise twice a day.")
        .await;
    assert!(attached.is_ready() && other.is_ready());

    let mut request = ask("Where are apples grown?");
    request.space_id = Some("space-1".to_string());
    request.document_ids = vec![attached.id];

    let turn = harness.state.chat().prepare(&request).await.unwrap();
    assert!(!turn.sources.is_empty());
    assert!(turn.sources.iter().all(|s| s.document_id == attached.id));

    let system = &turn.messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("orchards"));
    assert!(!system.content.contains("moon"));

    let response = harness.state.chat().complete(turn).await.unwrap();
    assert_eq!(response.choices[0].message.content, "Per [1], yes.");
    assert!(response.sources.iter().all(|s| s.document_id == attached.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unfinished_document_contributes_nothing() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["ok"]));
    let harness = Harness::new(vec![provider]).await;

    let doc = harness
        .ingest("space-1", "notes.txt", "The notes mention a harbour.")
        .await;
    assert!(doc.is_ready());
    // back to pending with its old chunks still stored
    harness.state.db().reset_for_reprocess(doc.id).unwrap();

    let mut request = ask("What do the notes say?");
    request.space_id = Some("space-1".to_string());
    request.document_ids = vec![doc.id];

    let turn = harness.state.chat().prepare(&request).await.unwrap();
    assert!(turn.sources.is_empty());
    assert!(!turn.messages[0].content.contains("harbour"));
}

#[tokio::test]
async fn test_regenerate_and_switch_branches() {
    let provider = ScriptedProvider::new(ProviderKind::Anthropic, Script::Reply(vec!["an answer"]));
    let harness = Harness::new(vec![provider]).await;
    let chat = harness.state.chat();
    let conversations = harness.state.conversations();

    let turn = chat.prepare(&ask("first question")).await.unwrap();
    let first = chat.complete(turn).await.unwrap();
    let conv_id = first.conversation_id;
    let original = conversations.find_message(first.message_id).await.unwrap().1;
    let parent_id = original.parent_id.unwrap();

    let turn = chat
        .prepare_regeneration(original.id, &RegenerateRequest::default())
        .await
        .unwrap();
    assert_eq!(turn.reply.parent_id, Some(parent_id));
    assert_ne!(turn.reply.branch_id, original.branch_id);
    let regenerated = chat.complete(turn).await.unwrap();
    assert_ne!(regenerated.message_id, original.id);

    let tree = conversations.snapshot(conv_id).await.unwrap();
    assert_eq!(tree.active_leaf(), Some(regenerated.message_id));
    assert_eq!(tree.leaf_count(), 2);

    conversations.switch_branch(conv_id, original.id).await.unwrap();
    let tree = conversations.snapshot(conv_id).await.unwrap();
    let path: Vec<Uuid> = tree.active_path().iter().map(|m| m.id).collect();
    assert_eq!(path, vec![parent_id, original.id]);

    conversations
        .switch_branch(conv_id, regenerated.message_id)
        .await
        .unwrap();
    let tree = conversations.snapshot(conv_id).await.unwrap();
    let path: Vec<Uuid> = tree.active_path().iter().map(|m| m.id).collect();
    assert_eq!(path, vec![parent_id, regenerated.message_id]);
    // the original reply stays stored and reachable
    assert_eq!(tree.get(original.id).unwrap().content, "an answer");
    assert_eq!(tree.path_to(original.id).len(), 2);
}

#[tokio::test]
async fn test_regenerating_user_message_is_rejected() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["hi"]));
    let harness = Harness::new(vec![provider]).await;
    let chat = harness.state.chat();

    let turn = chat.prepare(&ask("hello")).await.unwrap();
    let user_id = turn.reply.parent_id.unwrap();
    chat.complete(turn).await.unwrap();

    let result = chat
        .prepare_regeneration(user_id, &RegenerateRequest::default())
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_follow_up_uses_stored_history() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["noted"]));
    let harness = Harness::new(vec![provider]).await;
    let chat = harness.state.chat();

    let first = chat.complete(chat.prepare(&ask("remember 7")).await.unwrap()).await.unwrap();

    let mut follow_up = ask("what number?");
    follow_up.conversation_id = Some(first.conversation_id);
    let turn = chat.prepare(&follow_up).await.unwrap();

    let roles: Vec<Role> = turn.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    assert_eq!(turn.messages[1].content, "remember 7");
    assert_eq!(turn.messages[2].content, "noted");

    let tree = harness
        .state
        .conversations()
        .snapshot(first.conversation_id)
        .await
        .unwrap();
    let user = tree.get(turn.reply.parent_id.unwrap()).unwrap();
    assert_eq!(user.parent_id, Some(first.message_id));
}

#[tokio::test]
async fn test_rate_limit_mid_stream_reports_error_and_keeps_partial() {
    let primary = ScriptedProvider::new(
        ProviderKind::OpenAi,
        Script::FailMidStream(vec!["Hel", "lo"], ProviderErrorKind::RateLimited),
    );
    let backup = ScriptedProvider::new(ProviderKind::Local, Script::Reply(vec!["backup"]));
    let harness = Harness::new(vec![primary.clone(), backup.clone()]).await;
    let chat = harness.state.chat();

    let mut request = ask("stream please");
    request.stream = true;
    let turn = chat.prepare(&request).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);

    let frames = collect(chat.clone().stream(turn)).await;

    assert!(matches!(frames.last(), Some(StreamFrame::Error(_))));
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Done)));
    assert_eq!(streamed_text(&frames), "Hello");
    if let Some(StreamFrame::Error(body)) = frames.last() {
        assert_eq!(body["error"]["type"], "provider_error");
        assert_eq!(body["error"]["retryable"], true);
    }

    // output had already started: no fallback
    assert_eq!(backup.stream_calls(), 0);

    let tree = harness.state.conversations().snapshot(conv_id).await.unwrap();
    let stored = tree.get(reply_id).unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.content, "Hello");
    assert!(stored.error.is_some());
}

#[tokio::test]
async fn test_successful_stream_frames() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["a", "b", "c"]));
    let harness = Harness::new(vec![provider]).await;
    let chat = harness.state.chat();

    let turn = chat.prepare(&ask("letters")).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);
    let frames = collect(chat.clone().stream(turn)).await;

    let StreamFrame::Chunk(first) = &frames[0] else {
        panic!("expected a chunk first");
    };
    assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
    assert_eq!(first.message_id, Some(reply_id));
    assert_eq!(first.conversation_id, Some(conv_id));

    assert!(matches!(frames.last(), Some(StreamFrame::Done)));
    let StreamFrame::Chunk(last) = &frames[frames.len() - 2] else {
        panic!("expected the stop chunk before [DONE]");
    };
    assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
    assert_eq!(streamed_text(&frames), "abc");

    let tree = harness.state.conversations().snapshot(conv_id).await.unwrap();
    let stored = tree.get(reply_id).unwrap();
    assert_eq!(stored.status, MessageStatus::Complete);
    assert_eq!(stored.content, "abc");
}

#[tokio::test]
async fn test_client_disconnect_aborts_upstream() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Hang(vec!["partial"]));
    let harness = Harness::new(vec![provider.clone()]).await;
    let chat = harness.state.chat();

    let turn = chat.prepare(&ask("long answer")).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);
    let mut rx = chat.clone().stream(turn);

    // role frame, then the one delta
    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !provider.upstream_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream call was not aborted");

    let stored = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let tree = harness.state.conversations().snapshot(conv_id).await.unwrap();
            let message = tree.get(reply_id).unwrap().clone();
            if message.status != MessageStatus::Streaming {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.content, "partial");
    assert_eq!(stored.error.as_deref(), Some("cancelled by client"));
}

#[tokio::test]
async fn test_stream_falls_back_when_opening_fails() {
    let primary = ScriptedProvider::new(ProviderKind::OpenAi, Script::FailOpen(ProviderErrorKind::Unavailable));
    let backup = ScriptedProvider::new(ProviderKind::Anthropic, Script::Reply(vec!["from backup"]));
    let harness = Harness::new(vec![primary.clone(), backup.clone()]).await;
    let chat = harness.state.chat();

    let turn = chat.prepare(&ask("hello")).await.unwrap();
    let frames = collect(chat.clone().stream(turn)).await;

    assert!(matches!(frames.last(), Some(StreamFrame::Done)));
    assert_eq!(streamed_text(&frames), "from backup");
    let StreamFrame::Chunk(first) = &frames[0] else {
        panic!("expected a chunk first");
    };
    assert!(first.model.starts_with("anthropic:"));
    assert_eq!((primary.stream_calls(), backup.stream_calls()), (1, 1));
}

#[tokio::test]
async fn test_completion_falls_back_once() {
    let first = ScriptedProvider::new(ProviderKind::OpenAi, Script::FailOpen(ProviderErrorKind::Unavailable));
    let second = ScriptedProvider::new(ProviderKind::Anthropic, Script::FailOpen(ProviderErrorKind::RateLimited));
    let third = ScriptedProvider::new(ProviderKind::Local, Script::Reply(vec!["never"]));
    let harness = Harness::new(vec![first.clone(), second.clone(), third.clone()]).await;
    let chat = harness.state.chat();

    let turn = chat.prepare(&ask("hello")).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);
    let result = chat.complete(turn).await;

    assert!(matches!(result, Err(Error::Provider { kind: ProviderErrorKind::RateLimited, .. })));
    assert_eq!((first.chat_calls(), second.chat_calls(), third.chat_calls()), (1, 1, 0));

    let tree = harness.state.conversations().snapshot(conv_id).await.unwrap();
    assert_eq!(tree.get(reply_id).unwrap().status, MessageStatus::Error);
}

#[tokio::test]
async fn test_completion_fallback_success_and_no_fallback_on_auth() {
    let first = ScriptedProvider::new(ProviderKind::OpenAi, Script::FailOpen(ProviderErrorKind::Timeout));
    let second = ScriptedProvider::new(ProviderKind::Google, Script::Reply(vec!["rescued"]));
    let harness = Harness::new(vec![first, second]).await;
    let chat = harness.state.chat();

    let response = chat.complete(chat.prepare(&ask("hello")).await.unwrap()).await.unwrap();
    assert_eq!(response.choices[0].message.content, "rescued");
    assert!(response.model.starts_with("google:"));

    let denied = ScriptedProvider::new(ProviderKind::OpenAi, Script::FailOpen(ProviderErrorKind::Auth));
    let spare = ScriptedProvider::new(ProviderKind::Google, Script::Reply(vec!["unused"]));
    let harness = Harness::new(vec![denied, spare.clone()]).await;
    let chat = harness.state.chat();

    let result = chat.complete(chat.prepare(&ask("hello")).await.unwrap()).await;
    assert!(matches!(result, Err(Error::Provider { kind: ProviderErrorKind::Auth, .. })));
    assert_eq!(spare.chat_calls(), 0);
}

async fn settled_reply(harness: &Harness, conv_id: Uuid, reply_id: Uuid) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let tree = harness.state.conversations().snapshot(conv_id).await.unwrap();
            let message = tree.get(reply_id).unwrap().clone();
            if message.status != MessageStatus::Streaming {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reply was not persisted")
}

#[tokio::test]
async fn test_stream_deadline_ends_reply_with_error() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Hang(vec!["partial"]));
    let harness = Harness::with_providers(vec![provider.clone() as Arc<dyn ChatProvider>], |config| {
        config.chat.stream_timeout_secs = 1;
    })
    .await;
    let chat = harness.state.chat();

    let mut request = ask("take your time");
    request.stream = true;
    let turn = chat.prepare(&request).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);

    let frames = collect(chat.clone().stream(turn)).await;

    assert_eq!(streamed_text(&frames), "partial");
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Done)));
    let Some(StreamFrame::Error(body)) = frames.last() else {
        panic!("expected an error frame last");
    };
    assert_eq!(body["error"]["type"], "provider_error");

    tokio::time::timeout(Duration::from_secs(5), async {
        while !provider.upstream_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream call was not aborted");

    let stored = settled_reply(&harness, conv_id, reply_id).await;
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.content, "partial");
    assert!(stored.error.unwrap().contains("stream exceeded 1s"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_closing_without_done_fails_the_reply() {
    let base_url = common::sse_upstream(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    )
    .await;
    let provider = OpenAiCompatible::new(
        ProviderKind::OpenAi,
        ProviderSettings {
            base_url,
            chat_model: "gpt-4o-mini".to_string(),
            enabled: true,
            ..Default::default()
        },
    )
    .unwrap();
    let harness = Harness::with_providers(vec![Arc::new(provider) as Arc<dyn ChatProvider>], |_| {}).await;
    let chat = harness.state.chat();

    let mut request = ask("stream please");
    request.stream = true;
    let turn = chat.prepare(&request).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);

    let frames = collect(chat.clone().stream(turn)).await;

    assert_eq!(streamed_text(&frames), "Hel");
    assert!(matches!(frames.last(), Some(StreamFrame::Error(_))));
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Done)));

    let stored = settled_reply(&harness, conv_id, reply_id).await;
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.content, "Hel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_outlives_provider_call_timeout() {
    let base_url = common::paused_sse_upstream(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        Duration::from_secs(2),
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
    )
    .await;
    let provider = OpenAiCompatible::new(
        ProviderKind::OpenAi,
        ProviderSettings {
            base_url,
            chat_model: "gpt-4o-mini".to_string(),
            enabled: true,
            timeout_secs: 1,
            ..Default::default()
        },
    )
    .unwrap();
    let harness = Harness::with_providers(vec![Arc::new(provider) as Arc<dyn ChatProvider>], |_| {}).await;
    let chat = harness.state.chat();

    let mut request = ask("stream please");
    request.stream = true;
    let turn = chat.prepare(&request).await.unwrap();
    let (conv_id, reply_id) = (turn.conversation_id, turn.reply.id);

    let frames = collect(chat.clone().stream(turn)).await;

    assert_eq!(streamed_text(&frames), "Hello");
    assert!(matches!(frames.last(), Some(StreamFrame::Done)));
    let stored = settled_reply(&harness, conv_id, reply_id).await;
    assert_eq!(stored.status, MessageStatus::Complete);
}

#[tokio::test]
async fn test_rejected_request_leaves_nothing_behind() {
    let provider = ScriptedProvider::new(ProviderKind::OpenAi, Script::Reply(vec!["hi"]));
    let harness = Harness::new(vec![provider]).await;
    let chat = harness.state.chat();
    let conversations = harness.state.conversations();

    let mut bad_role = ask("hello");
    bad_role.messages.insert(
        0,
        RequestMessage {
            role: "tool".to_string(),
            content: MessageContent::Text("output".to_string()),
        },
    );
    assert!(matches!(chat.prepare(&bad_role).await, Err(Error::Validation(_))));

    let mut orphan = ask("hello");
    orphan.parent_message_id = Some(Uuid::new_v4());
    assert!(matches!(chat.prepare(&orphan).await, Err(Error::Validation(_))));
    assert!(conversations.list(None).unwrap().is_empty());

    let first = chat.complete(chat.prepare(&ask("hello")).await.unwrap()).await.unwrap();
    let mut stray = ask("again");
    stray.conversation_id = Some(first.conversation_id);
    stray.parent_message_id = Some(Uuid::new_v4());
    assert!(matches!(chat.prepare(&stray).await, Err(Error::NotFound { .. })));

    let tree = conversations.snapshot(first.conversation_id).await.unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree.active_leaf(), Some(first.message_id));
    assert_eq!(conversations.list(None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_regeneration_resends_stored_images() {
    let provider = ScriptedProvider::with_vision(ProviderKind::OpenAi, Script::Reply(vec!["a cat"]));
    let harness = Harness::new(vec![provider.clone()]).await;
    let chat = harness.state.chat();

    let content: MessageContent = serde_json::from_value(json!([
        {"type": "text", "text": "What is in this picture?"},
        {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo="}}
    ]))
    .unwrap();
    let request = ChatCompletionRequest {
        messages: vec![RequestMessage {
            role: "user".to_string(),
            content,
        }],
        ..Default::default()
    };

    let turn = chat.prepare(&request).await.unwrap();
    assert!(turn.needs_vision);
    let user_id = turn.reply.parent_id.unwrap();
    let first = chat.complete(turn).await.unwrap();
    assert_eq!(provider.last_image_count(), 1);

    let stored = harness.state.db().list_messages(first.conversation_id).unwrap();
    let user = stored.iter().find(|m| m.id == user_id).unwrap();
    assert_eq!(user.images, vec!["data:image/png;base64,iVBORw0KGgo=".to_string()]);

    let turn = chat
        .prepare_regeneration(first.message_id, &RegenerateRequest::default())
        .await
        .unwrap();
    assert!(turn.needs_vision);
    assert_eq!(turn.messages.last().unwrap().images.len(), 1);

    chat.complete(turn).await.unwrap();
    assert_eq!(provider.chat_calls(), 2);
    assert_eq!(provider.last_image_count(), 1);
}
