//! Provider Registry
//!
//! Dispatches each invocation to the invoker registered for its provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::traits::{InvocationError, InvocationRequest, InvocationResponse, ModelInvoker};

/// Provider name → invoker
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    invokers: HashMap<String, Arc<dyn ModelInvoker>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&String> = self.invokers.keys().collect();
        providers.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the invoker for a provider
    #[must_use]
    pub fn with(mut self, provider: impl Into<String>, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.register(provider, invoker);
        self
    }

    /// Register (or replace) the invoker for a provider in place
    pub fn register(&mut self, provider: impl Into<String>, invoker: Arc<dyn ModelInvoker>) {
        let provider = provider.into();
        if self.invokers.insert(provider.clone(), invoker).is_some() {
            tracing::warn!(provider = %provider, "Replacing registered invoker");
        }
    }

    /// Whether a provider has an invoker
    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.invokers.contains_key(provider)
    }

    /// Registered provider names, sorted
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.invokers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ModelInvoker for ProviderRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> Result<InvocationResponse, InvocationError> {
        let invoker = self
            .invokers
            .get(&request.provider)
            .ok_or_else(|| InvocationError::UnknownProvider(request.provider.clone()))?;
        invoker.invoke(request, cancel).await
    }
}
