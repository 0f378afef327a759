//! Provider adapter layer: HTTP core, per-vendor transforms, and the
//! named adapter manager.

pub mod anthropic;
pub mod generic;
pub mod http_core;
pub mod manager;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::model::{CompletionRequest, CompletionResponse, StreamChunk};

/// Bound on the streaming channel buffer, per §4.3.
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

/// The capability contract every provider adapter implements.
///
/// Represented as a trait object (`Arc<dyn LlmProvider>`) rather than an
/// inheritance tree, per the dynamic-dispatch design note: a thin dispatch
/// table over tagged concrete shapes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Adapter name, as configured (e.g. `"openai-primary"`).
    fn name(&self) -> &str;

    /// Send a non-streaming completion request.
    async fn send_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError>;

    /// Send a streaming completion request; chunks arrive on the returned
    /// receiver. The channel closes after a terminal chunk or an error chunk.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError>;

    /// Issue a lightweight health probe and update internal health state.
    async fn health_check(&self) -> Result<(), LlmError>;

    /// Current health snapshot.
    fn health(&self) -> crate::model::ProviderHealth;

    /// Model ids this adapter is configured to accept, if restricted.
    fn supported_models(&self) -> Option<&[String]>;

    /// Release pooled resources. Idempotent.
    async fn close(&self);
}
