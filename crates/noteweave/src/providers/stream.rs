//! Cancellable stream of text deltas from a provider

use futures::Stream;
use futures_util::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, ProviderErrorKind, Result};

use super::sse::{SseDecoder, SseFrame};

/// Sending half handed to the task that reads the upstream response
pub type DeltaSender = mpsc::Sender<Result<String>>;

const CHANNEL_CAPACITY: usize = 64;

/// What an adapter makes of one SSE frame
#[derive(Debug)]
pub enum FrameAction {
    /// A text fragment
    Delta(String),
    /// Upstream signalled the end of the reply
    Done,
    /// Upstream reported an error inside the stream
    Error(Error),
    /// Nothing to forward (metadata, pings, unparseable frames)
    Skip,
}

/// Sequence of text deltas backed by a spawned reader task
///
/// The reader task owns the upstream HTTP response. [`DeltaStream::cancel`] (and dropping
/// the stream) aborts that task, which drops the response and closes the upstream
/// connection instead of merely ceasing to read it.
pub struct DeltaStream {
    receiver: mpsc::Receiver<Result<String>>,
    task: Option<JoinHandle<()>>,
}

impl DeltaStream {
    /// Spawn `producer` and return the stream of what it sends
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(DeltaSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(producer(sender));
        Self {
            receiver,
            task: Some(task),
        }
    }

    /// Decode an SSE response body with `on_frame`, forwarding deltas until done
    ///
    /// With `explicit_end`, a body that closes before `on_frame` reports
    /// [`FrameAction::Done`] yields an [`unexpected_end`] error instead of a clean end.
    pub fn from_sse_response<F>(
        provider: String,
        response: reqwest::Response,
        explicit_end: bool,
        mut on_frame: F,
    ) -> Self
    where
        F: FnMut(&SseFrame) -> FrameAction + Send + 'static,
    {
        Self::spawn(move |tx| async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(super::transport_error(&provider, e))).await;
                        return;
                    }
                };

                for frame in decoder.push(&bytes) {
                    match on_frame(&frame) {
                        FrameAction::Done => return,
                        action => {
                            if !forward(&tx, action).await {
                                return;
                            }
                        }
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                match on_frame(&frame) {
                    FrameAction::Done => return,
                    action => {
                        if !forward(&tx, action).await {
                            return;
                        }
                    }
                }
            }

            if explicit_end {
                tracing::warn!("{} stream closed without a completion marker", provider);
                let _ = tx.send(Err(unexpected_end(&provider))).await;
            }
        })
    }

    /// Next delta; `None` once the upstream reply is complete
    pub async fn next_delta(&mut self) -> Option<Result<String>> {
        self.receiver.recv().await
    }

    /// Abort the upstream call
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Upstream stream aborted");
        }
        self.receiver.close();
    }

    /// Whether the stream was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.task.is_none()
    }
}

/// Forward one frame; false when the reader should stop
async fn forward(tx: &DeltaSender, action: FrameAction) -> bool {
    match action {
        FrameAction::Delta(text) if text.is_empty() => true,
        FrameAction::Delta(text) => tx.send(Ok(text)).await.is_ok(),
        FrameAction::Skip => true,
        FrameAction::Done => false,
        FrameAction::Error(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Stream for DeltaStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Error for a stream that ended without any explicit completion or error
pub fn unexpected_end(provider: &str) -> Error {
    Error::provider(provider, ProviderErrorKind::Unavailable, "stream ended unexpectedly")
}
