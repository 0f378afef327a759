//! Generic OpenAI-compatible adapter for local/self-hosted endpoints.
//!
//! Reuses the OpenAI wire protocol and request/response transforms; the API
//! key is optional and pool/retry defaults are smaller, matching typical
//! local-endpoint deployments.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::model::{CompletionRequest, CompletionResponse, StreamChunk};
use crate::providers::http_core::HttpCoreConfig;
use crate::providers::openai::{OpenAiConfig, OpenAiProvider};
use crate::providers::LlmProvider;

/// Configuration for one generic OpenAI-compatible adapter instance.
#[derive(Debug, Clone)]
pub struct GenericConfig {
    /// Adapter name, as configured.
    pub name: String,
    /// Base URL of the local/self-hosted endpoint.
    pub base_url: String,
    /// Optional bearer API key; many local endpoints accept any value or none.
    pub api_key: Option<String>,
}

impl GenericConfig {
    fn default_http() -> HttpCoreConfig {
        HttpCoreConfig {
            max_idle_per_host: 4,
            idle_timeout: std::time::Duration::from_secs(30),
            request_timeout: std::time::Duration::from_secs(15),
            max_retries: 1,
        }
    }
}

/// Thin wrapper delegating to [`OpenAiProvider`] with local-endpoint defaults.
pub struct GenericProvider {
    inner: OpenAiProvider,
}

impl GenericProvider {
    /// Build a new generic adapter from validated configuration.
    ///
    /// # Errors
    /// Returns [`LlmError::Config`] if the underlying HTTP client fails to build.
    pub fn new(config: GenericConfig) -> Result<Self, LlmError> {
        let inner = OpenAiProvider::new(OpenAiConfig {
            name: config.name,
            base_url: config.base_url,
            api_key: config.api_key.unwrap_or_default(),
            http: GenericConfig::default_http(),
        })?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.inner.send_completion(request).await
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        self.inner.stream_completion(request).await
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        self.inner.health_check().await
    }

    fn health(&self) -> crate::model::ProviderHealth {
        self.inner.health()
    }

    fn supported_models(&self) -> Option<&[String]> {
        self.inner.supported_models()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
