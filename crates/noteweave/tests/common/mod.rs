//! Shared harness: scripted providers and an in-memory application state

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use axum::body::Body;
use axum::http::header;
use axum::routing::post;
use axum::Router;
use noteweave::config::AppConfig;
use noteweave::error::{Error, ProviderErrorKind, Result};
use noteweave::processing::Upload;
use noteweave::providers::{
    ChatMessage, ChatOptions, ChatProvider, DeltaStream, ProviderKind, ProviderRegistry,
};
use noteweave::server::state::AppState;
use noteweave::storage::{BlobStore, Database, LocalBlobStore};
use noteweave::types::{Document, ProcessingStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// How a scripted provider answers chat calls
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with these deltas
    Reply(Vec<&'static str>),
    /// Fail before any output
    FailOpen(ProviderErrorKind),
    /// Stream these deltas, then fail
    FailMidStream(Vec<&'static str>, ProviderErrorKind),
    /// Stream these deltas, then never finish
    Hang(Vec<&'static str>),
}

/// Sets its flag when dropped, i.e. when the upstream task is torn down
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct ScriptedProvider {
    kind: ProviderKind,
    model: String,
    script: Script,
    vision: bool,
    pub chat_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    /// Images attached to the prompt of the latest call
    pub last_image_count: AtomicUsize,
    pub upstream_dropped: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind, script: Script) -> Arc<Self> {
        Arc::new(Self::build(kind, script, false))
    }

    /// A provider whose default model accepts images
    pub fn with_vision(kind: ProviderKind, script: Script) -> Arc<Self> {
        Arc::new(Self::build(kind, script, true))
    }

    fn build(kind: ProviderKind, script: Script, vision: bool) -> Self {
        Self {
            kind,
            model: format!("{}-model", kind.as_str()),
            script,
            vision,
            chat_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            last_image_count: AtomicUsize::new(0),
            upstream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn last_image_count(&self) -> usize {
        self.last_image_count.load(Ordering::SeqCst)
    }

    fn record_images(&self, messages: &[ChatMessage]) {
        let count = messages.iter().map(|m| m.images.len()).sum();
        self.last_image_count.store(count, Ordering::SeqCst);
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn failure(&self, kind: ProviderErrorKind) -> Error {
        Error::provider(self.kind.as_str(), kind, "scripted failure")
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn vision_model(&self) -> Option<&str> {
        None
    }

    fn supports_vision(&self, _model: &str) -> bool {
        self.vision
    }

    async fn chat(&self, messages: &[ChatMessage], _: &str, _: &ChatOptions) -> Result<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.record_images(messages);
        match &self.script {
            Script::Reply(parts) => Ok(parts.concat()),
            Script::FailOpen(kind) | Script::FailMidStream(_, kind) => Err(self.failure(*kind)),
            Script::Hang(_) => std::future::pending().await,
        }
    }

    async fn stream_chat(&self, messages: &[ChatMessage], _: &str, _: &ChatOptions) -> Result<DeltaStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record_images(messages);
        let script = self.script.clone();
        let error = match &script {
            Script::FailOpen(kind) => return Err(self.failure(*kind)),
            Script::FailMidStream(_, kind) => Some(self.failure(*kind)),
            _ => None,
        };
        let flag = DropFlag(self.upstream_dropped.clone());

        Ok(DeltaStream::spawn(move |tx| async move {
            let _flag = flag;
            let (parts, hang) = match script {
                Script::Reply(parts) | Script::FailMidStream(parts, _) => (parts, false),
                Script::Hang(parts) => (parts, true),
                Script::FailOpen(_) => return,
            };
            for part in parts {
                if tx.send(Ok(part.to_string())).await.is_err() {
                    return;
                }
            }
            if let Some(error) = error {
                let _ = tx.send(Err(error)).await;
            }
            if hang {
                std::future::pending::<()>().await;
            }
        }))
    }

    /// Letter-frequency vector, enough to rank texts by shared vocabulary
    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>> {
        let lower = text.to_ascii_lowercase();
        Ok(['a', 'e', 'i', 'o', 'u', 's', 't', 'n']
            .iter()
            .map(|c| lower.chars().filter(|x| x == c).count() as f32 + 1.0)
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Application state over an in-memory database and a temporary blob directory
pub struct Harness {
    pub state: AppState,
    _dir: TempDir,
}

impl Harness {
    /// The first provider also serves embeddings
    pub async fn new(providers: Vec<Arc<ScriptedProvider>>) -> Self {
        let providers: Vec<Arc<dyn ChatProvider>> = providers
            .into_iter()
            .map(|p| p as Arc<dyn ChatProvider>)
            .collect();
        Self::with_providers(providers, |_| {}).await
    }

    /// Any providers, with `adjust` applied to the test configuration
    pub async fn with_providers(
        providers: Vec<Arc<dyn ChatProvider>>,
        adjust: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.embeddings.provider = providers[0].kind();
        config.embeddings.dimensions = 0;
        config.ingestion.workers = Some(2);
        config.ingestion.retry.max_retries = 0;
        config.chat.stream_timeout_secs = 30;
        adjust(&mut config);

        let registry = Arc::new(ProviderRegistry::with_providers(providers));
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(dir.path().join("blobs")).unwrap());

        let state = AppState::with_components(config, Database::in_memory().unwrap(), blobs, registry)
            .await
            .unwrap();
        Self { state, _dir: dir }
    }

    pub fn text_upload(space_id: &str, filename: &str, text: &str) -> Upload {
        Upload {
            space_id: space_id.to_string(),
            filename: filename.to_string(),
            content_type: Some("text/plain".to_string()),
            title: None,
            tags: Vec::new(),
            data: text.as_bytes().to_vec(),
        }
    }

    /// Upload a text file and wait for ingestion to finish
    pub async fn ingest(&self, space_id: &str, filename: &str, text: &str) -> Document {
        let doc = self
            .state
            .documents()
            .accept(Self::text_upload(space_id, filename, text))
            .await
            .unwrap();
        self.wait_for(doc.id).await
    }

    pub async fn wait_for(&self, id: Uuid) -> Document {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let doc = self.state.documents().get(id).unwrap();
                match doc.processing_status {
                    ProcessingStatus::Completed | ProcessingStatus::Failed => return doc,
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("ingestion did not finish")
    }
}

/// Serve `body` as the SSE reply of an OpenAI-style `/v1/chat/completions`; returns the base URL
pub async fn sse_upstream(body: &'static str) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

/// Like [`sse_upstream`], but sends `rest` only after `pause`
pub async fn paused_sse_upstream(first: &'static str, pause: Duration, rest: &'static str) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            let parts = futures::stream::iter([(first, Duration::ZERO), (rest, pause)]).then(
                |(part, wait)| async move {
                    tokio::time::sleep(wait).await;
                    Ok::<_, std::convert::Infallible>(part)
                },
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(parts))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}
