//! Transport trait and the provider-routing client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::SDKError;
use crate::types::{CompletionOptions, Request, Response};

/// External completion transport.
///
/// Implementations must observe `options.signal`: once it is aborted they should
/// stop streaming and return a response with [`crate::StopReason::Aborted`]
/// carrying whatever partial message they accumulated.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: Request,
        options: CompletionOptions,
    ) -> Result<Response, SDKError>;
}

/// Routes requests to a registered transport by provider name.
#[derive(Clone, Default)]
pub struct Client {
    providers: HashMap<String, Arc<dyn CompletionTransport>>,
    default_provider: Option<String>,
}

impl Client {
    pub fn new(
        providers: HashMap<String, Arc<dyn CompletionTransport>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers,
            default_provider,
        }
    }

    pub fn register_provider(
        &mut self,
        provider: Arc<dyn CompletionTransport>,
    ) -> Result<(), SDKError> {
        let name = provider.name().to_string();
        if name.trim().is_empty() {
            return Err(SDKError::configuration("provider name must not be empty"));
        }
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn set_default_provider(&mut self, provider: impl Into<String>) {
        self.default_provider = Some(provider.into());
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn resolve_provider(&self, request: &Request) -> Result<String, SDKError> {
        if let Some(provider) = request.provider.as_deref().filter(|p| !p.is_empty()) {
            return Ok(provider.to_string());
        }
        self.default_provider
            .clone()
            .ok_or_else(|| SDKError::configuration("no provider specified and no default set"))
    }
}

#[async_trait]
impl CompletionTransport for Client {
    fn name(&self) -> &str {
        "client"
    }

    async fn complete(
        &self,
        mut request: Request,
        options: CompletionOptions,
    ) -> Result<Response, SDKError> {
        let provider_name = self.resolve_provider(&request)?;
        let adapter = self
            .providers
            .get(&provider_name)
            .cloned()
            .ok_or_else(|| {
                SDKError::configuration(format!("provider '{provider_name}' not registered"))
            })?;
        debug!(provider = %provider_name, model = %request.model, "routing completion");
        request.provider = Some(provider_name);
        adapter.complete(request, options).await
    }
}
