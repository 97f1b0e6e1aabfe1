//! Text embeddings through a provider's embedding endpoint

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::providers::retry::retry_with_backoff;
use crate::providers::{ChatProvider, ProviderRegistry};

/// Produces fixed-dimension vectors for text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored with every vector; vectors of different ids are never compared
    fn model_id(&self) -> &str;

    /// Embed one text, retrying transient failures
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedder backed by a registered [`ChatProvider`]
pub struct ProviderEmbedder {
    provider: Option<Arc<dyn ChatProvider>>,
    model: String,
    model_id: String,
    dimensions: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ProviderEmbedder {
    pub fn new(
        config: &EmbeddingConfig,
        registry: &ProviderRegistry,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let provider = registry.get(config.provider);
        if provider.is_none() {
            tracing::warn!(
                "Embedding provider {} is not configured; ingestion will fail until it is",
                config.provider
            );
        }
        Self {
            provider,
            model: config.model.clone(),
            model_id: config.model_id(),
            dimensions: config.dimensions,
            retry,
            timeout,
        }
    }

    /// Use a specific provider instance
    pub fn with_provider(
        provider: Arc<dyn ChatProvider>,
        config: &EmbeddingConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider: Some(provider),
            model: config.model.clone(),
            model_id: config.model_id(),
            dimensions: config.dimensions,
            retry,
            timeout,
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::embedding(format!("No provider configured for {}", self.model_id)))?;

        let vector = retry_with_backoff(&self.retry, self.timeout, provider.name(), || {
            provider.embed(text, &self.model)
        })
        .await?;

        if self.dimensions > 0 && vector.len() != self.dimensions {
            return Err(Error::embedding(format!(
                "{} returned {} dimensions, expected {}",
                self.model_id,
                vector.len(),
                self.dimensions
            )));
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::providers::{ChatMessage, ChatOptions, DeltaStream, ProviderKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyEmbeddings {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatProvider for FlakyEmbeddings {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }
        fn name(&self) -> &str {
            "local"
        }
        fn default_model(&self) -> &str {
            "m"
        }
        fn vision_model(&self) -> Option<&str> {
            None
        }
        fn supports_vision(&self, _: &str) -> bool {
            false
        }
        async fn chat(&self, _: &[ChatMessage], _: &str, _: &ChatOptions) -> Result<String> {
            Ok(String::new())
        }
        async fn stream_chat(&self, _: &[ChatMessage], _: &str, _: &ChatOptions) -> Result<DeltaStream> {
            Ok(DeltaStream::spawn(|_tx| async {}))
        }
        async fn embed(&self, _: &str, _: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::provider("local", ProviderErrorKind::RateLimited, "slow down"))
            } else {
                Ok(vec![0.5; 4])
            }
        }
        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn config(dimensions: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: ProviderKind::Local,
            model: "m".into(),
            dimensions,
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let provider = Arc::new(FlakyEmbeddings { failures: 2, calls: AtomicU32::new(0) });
        let embedder = ProviderEmbedder::with_provider(provider.clone(), &config(4), fast_retry(3), Duration::from_secs(1));

        assert_eq!(embedder.embed("x").await.unwrap().len(), 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(embedder.model_id(), "local:m");
    }

    #[tokio::test]
    async fn test_gives_up_after_policy() {
        let provider = Arc::new(FlakyEmbeddings { failures: 10, calls: AtomicU32::new(0) });
        let embedder = ProviderEmbedder::with_provider(provider.clone(), &config(4), fast_retry(1), Duration::from_secs(1));

        assert!(embedder.embed("x").await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let provider = Arc::new(FlakyEmbeddings { failures: 0, calls: AtomicU32::new(0) });
        let embedder = ProviderEmbedder::with_provider(provider, &config(768), fast_retry(0), Duration::from_secs(1));
        assert!(matches!(embedder.embed("x").await, Err(Error::Embedding(_))));
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let registry = ProviderRegistry::with_providers(vec![]);
        let embedder = ProviderEmbedder::new(&config(4), &registry, fast_retry(0), Duration::from_secs(1));
        assert!(matches!(embedder.embed("x").await, Err(Error::Embedding(_))));
    }
}
