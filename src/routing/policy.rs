//! The policy-decision interface consumed by routing and the request
//! pipeline.
//!
//! The policy language, its parser/validator, and the Git-backed policy
//! source are external collaborators; the core only ever calls
//! [`PolicyEngine::evaluate`] and interprets the returned [`PolicyDecision`].

use async_trait::async_trait;

use crate::error::LlmError;
use crate::model::{EnrichedRequest, PolicyAction, PolicyDecision};

/// How the pipeline should behave when policy evaluation itself fails
/// (timeout, collaborator unavailable, malformed decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailSafeMode {
    /// Treat the evaluation failure as an implicit `allow`, with a warning logged.
    FailOpen,
    /// Treat the evaluation failure as an implicit `block`.
    FailClosed,
}

impl Default for FailSafeMode {
    fn default() -> Self {
        // Default for the request path is fail-open with a warning.
        Self::FailOpen
    }
}

/// The collaborator's only exposed method: evaluate an enriched request and
/// return a decision.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate `request` and return the action to take.
    ///
    /// # Errors
    /// Returns an error if the collaborator could not produce a decision
    /// (e.g. it is unreachable, or evaluation timed out).
    async fn evaluate(&self, request: &EnrichedRequest) -> Result<PolicyDecision, LlmError>;
}

/// Evaluate `request` against `engine`, applying `fail_safe` if the
/// collaborator itself errors.
pub async fn evaluate_with_fail_safe(
    engine: &dyn PolicyEngine,
    request: &EnrichedRequest,
    fail_safe: FailSafeMode,
) -> PolicyDecision {
    match engine.evaluate(request).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(error = %e, request_id = %request.request_id, "policy evaluation failed");
            match fail_safe {
                FailSafeMode::FailOpen => PolicyDecision {
                    action: PolicyAction::Allow,
                    block_reason: None,
                    routing_target: None,
                    transforms: None,
                    policy_version: "fail-open".to_owned(),
                    cost_estimate: 0.0,
                },
                FailSafeMode::FailClosed => PolicyDecision {
                    action: PolicyAction::Block,
                    block_reason: Some(format!("policy evaluation failed: {e}")),
                    routing_target: None,
                    transforms: None,
                    policy_version: "fail-closed".to_owned(),
                    cost_estimate: 0.0,
                },
            }
        }
    }
}

/// A policy engine stub that always allows. Useful for tests and for
/// standalone operation before a real policy collaborator is wired in.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEngine for AllowAllPolicy {
    async fn evaluate(&self, _request: &EnrichedRequest) -> Result<PolicyDecision, LlmError> {
        Ok(PolicyDecision {
            action: PolicyAction::Allow,
            block_reason: None,
            routing_target: None,
            transforms: None,
            policy_version: "allow-all".to_owned(),
            cost_estimate: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompletionRequest, RequestId};
    use std::collections::HashMap;

    struct FailingPolicy;

    #[async_trait]
    impl PolicyEngine for FailingPolicy {
        async fn evaluate(&self, _request: &EnrichedRequest) -> Result<PolicyDecision, LlmError> {
            Err(LlmError::Config {
                provider: "policy".to_owned(),
                field: "endpoint".to_owned(),
                message: "unreachable".to_owned(),
            })
        }
    }

    fn sample_request() -> EnrichedRequest {
        EnrichedRequest {
            request_id: RequestId::new(),
            request: CompletionRequest {
                model: "gpt-4o".into(),
                messages: vec![],
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: None,
                presence_penalty: None,
                frequency_penalty: None,
                user: None,
                tools: None,
                tool_choice: None,
                stream: false,
                metadata: HashMap::new(),
            },
            user: "u1".into(),
            api_key_id: "k1".into(),
            session_id: None,
            token_estimate: 0,
            content_analysis_summary: String::new(),
            cost_estimate: 0.0,
            conversation_summary: String::new(),
        }
    }

    #[tokio::test]
    async fn fail_open_allows_on_evaluation_error() {
        let decision = evaluate_with_fail_safe(&FailingPolicy, &sample_request(), FailSafeMode::FailOpen).await;
        assert_eq!(decision.action, PolicyAction::Allow);
    }

    #[tokio::test]
    async fn fail_closed_blocks_on_evaluation_error() {
        let decision = evaluate_with_fail_safe(&FailingPolicy, &sample_request(), FailSafeMode::FailClosed).await;
        assert_eq!(decision.action, PolicyAction::Block);
    }

    #[tokio::test]
    async fn allow_all_policy_always_allows() {
        let decision = AllowAllPolicy.evaluate(&sample_request()).await.expect("should evaluate");
        assert_eq!(decision.action, PolicyAction::Allow);
    }
}
