//! Provider registry, built once at startup

use serde::Serialize;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::error::Result;

use super::anthropic::AnthropicProvider;
use super::google::GoogleProvider;
use super::openai::OpenAiCompatible;
use super::{ChatProvider, ProviderKind};

/// Immutable set of configured providers, held in priority order
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChatProvider>>,
}

/// Public description of a registered provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub default_model: String,
    pub vision_model: Option<String>,
    /// Position in the fallback order (0 = preferred)
    pub priority: usize,
}

impl ProviderRegistry {
    /// Register an adapter for every provider that has credentials
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut providers: Vec<Arc<dyn ChatProvider>> = Vec::new();

        for kind in &config.priority {
            if providers.iter().any(|p| p.kind() == *kind) {
                continue;
            }
            let settings = config.settings(*kind);
            if !settings.is_configured() {
                tracing::debug!("Provider {} not configured, skipping", kind);
                continue;
            }

            let provider: Arc<dyn ChatProvider> = match kind {
                ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings.clone())?),
                ProviderKind::Google => Arc::new(GoogleProvider::new(settings.clone())?),
                ProviderKind::OpenAi
                | ProviderKind::DeepSeek
                | ProviderKind::OpenRouter
                | ProviderKind::Local => Arc::new(OpenAiCompatible::new(*kind, settings.clone())?),
            };
            tracing::info!("Registered provider {} (default model {})", kind, settings.chat_model);
            providers.push(provider);
        }

        if providers.is_empty() {
            tracing::warn!("No AI provider configured; chat and embeddings will be unavailable");
        }

        Ok(Self { providers })
    }

    /// Build from ready-made adapters, already in priority order
    pub fn with_providers(providers: Vec<Arc<dyn ChatProvider>>) -> Self {
        Self { providers }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ChatProvider>> {
        self.providers.iter().find(|p| p.kind() == kind).cloned()
    }

    /// Registered providers in priority order
    pub fn providers(&self) -> &[Arc<dyn ChatProvider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn describe(&self) -> Vec<ProviderInfo> {
        self.providers
            .iter()
            .enumerate()
            .map(|(priority, p)| ProviderInfo {
                kind: p.kind(),
                default_model: p.default_model().to_string(),
                vision_model: p.vision_model().map(str::to_string),
                priority,
            })
            .collect()
    }
}
