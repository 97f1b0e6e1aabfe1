//! Model selection: explicit choice, vision auto-switch, priority default and one fallback

use std::sync::Arc;

use crate::error::{Error, Result};

use super::{ChatProvider, ProviderKind, ProviderRegistry};

/// Why a provider/model pair was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Caller named the model
    Explicit,
    /// Caller's model cannot read images; a vision model was substituted
    VisionSwitch,
    /// No model requested; first configured provider in priority order
    Default,
    /// Previous provider failed with a retryable error
    Fallback,
}

/// Resolved provider and model for one request
#[derive(Clone)]
pub struct ModelSelection {
    pub provider: Arc<dyn ChatProvider>,
    pub model: String,
    pub reason: SelectionReason,
}

impl ModelSelection {
    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// `provider:model` label
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider.kind(), self.model)
    }
}

impl std::fmt::Debug for ModelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSelection")
            .field("provider", &self.provider.kind())
            .field("model", &self.model)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Chooses provider and model per request; depends only on the provider trait
#[derive(Clone)]
pub struct ModelSelector {
    registry: Arc<ProviderRegistry>,
}

impl ModelSelector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Split `provider:model`; a bare name has its provider inferred
    pub fn parse_model(spec: &str) -> (ProviderKind, String) {
        if let Some((prefix, model)) = spec.split_once(':') {
            if let Some(kind) = ProviderKind::parse(prefix) {
                return (kind, model.to_string());
            }
        }
        (ProviderKind::infer_from_model(spec), spec.to_string())
    }

    /// Resolve a request
    pub fn select(&self, requested: Option<&str>, needs_vision: bool) -> Result<ModelSelection> {
        if self.registry.is_empty() {
            return Err(Error::Config("No AI provider is configured".into()));
        }

        let selection = match requested.map(str::trim).filter(|m| !m.is_empty()) {
            Some(spec) => {
                let (kind, model) = Self::parse_model(spec);
                let provider = self.registry.get(kind).ok_or_else(|| {
                    Error::validation(format!(
                        "Model '{}' needs provider '{}', which is not configured",
                        spec, kind
                    ))
                })?;
                let model = if model.is_empty() {
                    provider.default_model().to_string()
                } else {
                    model
                };
                ModelSelection {
                    provider,
                    model,
                    reason: SelectionReason::Explicit,
                }
            }
            None => {
                let provider = self.registry.providers()[0].clone();
                ModelSelection {
                    model: provider.default_model().to_string(),
                    provider,
                    reason: SelectionReason::Default,
                }
            }
        };

        if needs_vision && !selection.provider.supports_vision(&selection.model) {
            let switched = self.vision_substitute(&selection.provider).ok_or_else(|| {
                Error::validation("The request contains images but no vision-capable model is configured")
            })?;
            tracing::info!(
                "Switching {} to vision model {} for image input",
                selection.label(),
                switched.label()
            );
            return Ok(switched);
        }

        tracing::debug!("Selected {} ({:?})", selection.label(), selection.reason);
        Ok(selection)
    }

    /// Best vision model: the same provider's mapping first, then priority order
    fn vision_substitute(&self, preferred: &Arc<dyn ChatProvider>) -> Option<ModelSelection> {
        std::iter::once(preferred)
            .chain(self.registry.providers().iter())
            .find_map(|p| {
                let model = p.vision_model()?;
                p.supports_vision(model).then(|| ModelSelection {
                    provider: p.clone(),
                    model: model.to_string(),
                    reason: SelectionReason::VisionSwitch,
                })
            })
    }

    /// Next provider in priority order after `failed`
    ///
    /// A selection that is already a fallback gets none, so a request falls back at most once.
    pub fn fallback_after(&self, failed: &ModelSelection, needs_vision: bool) -> Option<ModelSelection> {
        if failed.reason == SelectionReason::Fallback {
            return None;
        }

        let providers = self.registry.providers();
        let position = providers.iter().position(|p| p.kind() == failed.kind())?;

        providers
            .iter()
            .cycle()
            .skip(position + 1)
            .take(providers.len() - 1)
            .find_map(|p| {
                let model = if needs_vision {
                    p.vision_model().filter(|m| p.supports_vision(m))?
                } else {
                    p.default_model()
                };
                Some(ModelSelection {
                    provider: p.clone(),
                    model: model.to_string(),
                    reason: SelectionReason::Fallback,
                })
            })
    }
}
