//! Request pipeline: enrichment → policy decision → routing decision →
//! provider dispatch → evidence recording.
//!
//! Wires together the otherwise-independent modules (`routing`, `providers`,
//! `evidence`) into the single sequence described by the overview: edge →
//! enrichment → policy → routing → adapter → response, with evidence
//! recording firing asynchronously off the hot path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::evidence::recorder::{EvidenceRecorder, Submission};
use crate::model::{
    estimate_tokens, CompletionRequest, CompletionResponse, EnrichedRequest, PolicyAction,
    RequestId, StreamChunk,
};
use crate::providers::manager::ProviderManager;
use crate::routing::policy::{evaluate_with_fail_safe, FailSafeMode, PolicyEngine};
use crate::routing::{RoutingEngine, RoutingRequest};

/// Identity fields the HTTP edge resolved for the caller, independent of
/// request body content.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Authenticated user id.
    pub user: String,
    /// API-key id used for the call.
    pub api_key_id: String,
    /// Client-supplied session id, if any.
    pub session_id: Option<String>,
    /// Caller-specified provider override, if any.
    pub preferred_provider: Option<String>,
}

/// Everything the pipeline needs to serve one request.
pub struct Pipeline {
    manager: Arc<ProviderManager>,
    routing: Arc<RoutingEngine>,
    policy: Arc<dyn PolicyEngine>,
    fail_safe: FailSafeMode,
    recorder: Option<Arc<EvidenceRecorder>>,
}

impl Pipeline {
    /// Construct a pipeline from its collaborators. `recorder` is `None`
    /// when the evidence pipeline is disabled.
    #[must_use]
    pub fn new(
        manager: Arc<ProviderManager>,
        routing: Arc<RoutingEngine>,
        policy: Arc<dyn PolicyEngine>,
        fail_safe: FailSafeMode,
        recorder: Option<Arc<EvidenceRecorder>>,
    ) -> Self {
        Self {
            manager,
            routing,
            policy,
            fail_safe,
            recorder,
        }
    }

    fn enrich(&self, request: CompletionRequest, caller: CallerContext) -> EnrichedRequest {
        let token_estimate = estimate_tokens(&request.messages);
        let content_analysis_summary = format!("{} messages, ~{token_estimate} tokens", request.messages.len());
        let conversation_summary = request
            .messages
            .last()
            .map(|m| m.content.chars().take(120).collect::<String>())
            .unwrap_or_default();

        EnrichedRequest {
            request_id: RequestId::new(),
            request,
            user: caller.user,
            api_key_id: caller.api_key_id,
            session_id: caller.session_id,
            token_estimate,
            content_analysis_summary,
            cost_estimate: 0.0,
            conversation_summary,
        }
    }

    /// Run one non-streaming request through the full pipeline.
    ///
    /// # Errors
    /// Returns an error if validation, policy, routing, or the provider
    /// adapter itself fails. A policy `Block` decision surfaces as
    /// [`LlmError::Validation`].
    pub async fn handle_completion(
        &self,
        request: CompletionRequest,
        caller: CallerContext,
    ) -> Result<CompletionResponse, LlmError> {
        request.validate()?;
        let preferred_provider = caller.preferred_provider.clone();
        let enriched = self.enrich(request, caller);
        let request_id = enriched.request_id;

        let decision = evaluate_with_fail_safe(self.policy.as_ref(), &enriched, self.fail_safe).await;

        if decision.action == PolicyAction::Block {
            let reason = decision.block_reason.clone().unwrap_or_else(|| "blocked by policy".to_owned());
            self.record(&enriched, &decision, None, Some(reason.clone()), "none", 0.0).await;
            return Err(LlmError::Validation {
                field: "policy".to_owned(),
                message: reason,
            });
        }

        let preferred = match decision.action {
            PolicyAction::Route => decision.routing_target.as_ref().map(|t| t.provider.clone()),
            _ => preferred_provider,
        };

        let routing_request = RoutingRequest::from_enriched(&enriched, Some(decision.clone()), preferred);
        let route = self.routing.route(&routing_request).await;
        let route = match route {
            Ok(r) => r,
            Err(e) => {
                self.record(&enriched, &decision, None, Some(e.to_string()), "none", 0.0).await;
                return Err(e);
            }
        };

        debug!(request_id = %request_id, provider = %route.provider_name, strategy = %route.strategy, "routed request");

        let provider = self
            .manager
            .get(&route.provider_name)
            .ok_or_else(|| LlmError::ProviderNotFound(route.provider_name.clone()))?;

        let result = provider.send_completion(&enriched.request).await;
        match &result {
            Ok(response) => {
                self.record(&enriched, &decision, Some(response.clone()), None, &route.provider_name, decision.cost_estimate).await;
            }
            Err(e) => {
                warn!(request_id = %request_id, provider = %route.provider_name, error = %e, "provider request failed");
                self.record(&enriched, &decision, None, Some(e.to_string()), &route.provider_name, 0.0).await;
            }
        }
        result
    }

    /// Run one streaming request through the full pipeline, returning a
    /// receiver of chunks. Evidence is recorded once the stream completes,
    /// using the concatenation of all deltas as the recorded response.
    ///
    /// # Errors
    /// Returns an error for the same reasons as [`Pipeline::handle_completion`],
    /// before any chunk is produced.
    pub async fn handle_stream(
        &self,
        request: CompletionRequest,
        caller: CallerContext,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        request.validate()?;
        let preferred_provider = caller.preferred_provider.clone();
        let enriched = self.enrich(request, caller);
        let decision = evaluate_with_fail_safe(self.policy.as_ref(), &enriched, self.fail_safe).await;

        if decision.action == PolicyAction::Block {
            let reason = decision.block_reason.clone().unwrap_or_else(|| "blocked by policy".to_owned());
            self.record(&enriched, &decision, None, Some(reason.clone()), "none", 0.0).await;
            return Err(LlmError::Validation {
                field: "policy".to_owned(),
                message: reason,
            });
        }

        let preferred = match decision.action {
            PolicyAction::Route => decision.routing_target.as_ref().map(|t| t.provider.clone()),
            _ => preferred_provider,
        };
        let routing_request = RoutingRequest::from_enriched(&enriched, Some(decision.clone()), preferred);
        let route = self.routing.route(&routing_request).await?;

        let provider = self
            .manager
            .get(&route.provider_name)
            .ok_or_else(|| LlmError::ProviderNotFound(route.provider_name.clone()))?;

        let upstream = provider.stream_completion(&enriched.request).await?;
        let recorder = self.recorder.clone();
        let enriched_for_record = enriched.clone();
        let decision_for_record = decision.clone();
        let provider_name = route.provider_name.clone();

        let (tx, rx) = mpsc::channel(crate::providers::STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            forward_and_record(upstream, tx, recorder, enriched_for_record, decision_for_record, provider_name).await;
        });

        Ok(rx)
    }

    async fn record(
        &self,
        enriched: &EnrichedRequest,
        decision: &crate::model::PolicyDecision,
        response: Option<CompletionResponse>,
        error: Option<String>,
        provider: &str,
        actual_cost: f64,
    ) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        recorder
            .submit(Submission {
                enriched: enriched.clone(),
                decision: decision.clone(),
                response,
                error,
                provider: provider.to_owned(),
                actual_cost,
            })
            .await;
    }
}

async fn forward_and_record(
    mut upstream: mpsc::Receiver<StreamChunk>,
    tx: mpsc::Sender<StreamChunk>,
    recorder: Option<Arc<EvidenceRecorder>>,
    enriched: EnrichedRequest,
    decision: crate::model::PolicyDecision,
    provider: String,
) {
    let mut content = String::new();
    let mut last_finish = None;
    let mut usage = crate::model::UsageStats::new(0, 0);
    let mut error: Option<String> = None;

    while let Some(chunk) = upstream.recv().await {
        content.push_str(&chunk.delta);
        if let Some(reason) = chunk.finish_reason {
            last_finish = Some(reason);
        }
        if let Some(u) = &chunk.usage {
            usage = u.clone();
        }
        if let Some(e) = &chunk.error {
            error = Some(e.clone());
        }
        if tx.send(chunk).await.is_err() {
            return;
        }
    }

    let response = error.is_none().then(|| CompletionResponse {
        id: enriched.request_id.to_string(),
        model: enriched.request.model.clone(),
        content,
        finish_reason: last_finish.unwrap_or(crate::model::FinishReason::Stop),
        usage,
        tool_calls: None,
        created_at: chrono::Utc::now(),
        metadata: std::collections::HashMap::new(),
    });

    if let Some(recorder) = recorder {
        recorder
            .submit(Submission {
                enriched,
                decision,
                response,
                error,
                provider,
                actual_cost: 0.0,
            })
            .await;
    }
}

/// Drain the recorder on shutdown, waiting up to `deadline` for the writer
/// to flush.
pub async fn shutdown_recorder(recorder: Option<Arc<EvidenceRecorder>>, deadline: Duration) {
    if let Some(recorder) = recorder {
        recorder.close(deadline).await;
    }
}
