//! Provider-neutral request/response shapes shared by every adapter.
//!
//! These types are the wire-independent core the rest of the crate operates
//! on; adapters translate to and from vendor-specific JSON at the edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / instruction message.
    System,
    /// End-user message.
    User,
    /// Model-generated message.
    Assistant,
    /// Tool result echoed back to the model.
    Tool,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message.
    pub role: Role,
    /// Textual content.
    pub content: String,
    /// Optional sender name (used by some providers to disambiguate).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Tool calls emitted by the assistant, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The id of the tool call this message is a result for.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
}

/// A callable tool definition presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON-schema-shaped parameter object.
    pub parameters: serde_json::Value,
}

/// A single invocation of a tool by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id for this call, echoed back by the caller's tool result.
    pub id: String,
    /// Fixed discriminator, always `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The function being called.
    pub function: ToolCallFunction,
}

/// The function payload of a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// JSON-encoded arguments string.
    pub arguments: String,
}

/// Normalized completion finish reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Truncated at the token limit.
    Length,
    /// The model requested one or more tool calls.
    ToolCalls,
    /// Stopped by content filtering.
    ContentFilter,
}

impl FinishReason {
    /// Normalize an upstream finish-reason string per the adapter mapping table.
    #[must_use]
    pub fn normalize(upstream: &str) -> Option<Self> {
        match upstream {
            "stop" | "end_turn" | "stop_sequence" => Some(Self::Stop),
            "length" | "max_tokens" => Some(Self::Length),
            "tool_calls" | "function_call" | "tool_use" => Some(Self::ToolCalls),
            "content_filter" => Some(Self::ContentFilter),
            _ => None,
        }
    }
}

/// Token usage accounting for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
    /// Total tokens (must equal prompt + completion).
    pub total_tokens: u64,
}

impl UsageStats {
    /// Construct usage stats, deriving `total_tokens`.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Selector for how the model may choose to call tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides freely.
    Auto,
    /// Model must not call a tool.
    None,
    /// Model must call a tool.
    Required,
}

/// A provider-neutral chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model id requested by the caller.
    pub model: String,
    /// Ordered, non-empty message history.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stop: Option<Vec<String>>,
    /// Presence penalty.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub presence_penalty: Option<f32>,
    /// Frequency penalty.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frequency_penalty: Option<f32>,
    /// Opaque end-user tag, forwarded to providers that support it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    /// Tools available to the model.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tools: Option<Vec<Tool>>,
    /// Tool-choice selector.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_choice: Option<ToolChoice>,
    /// Whether the caller wants a server-sent-event stream back.
    #[serde(default)]
    pub stream: bool,

    /// Internal metadata, never transmitted to an upstream provider.
    #[serde(skip)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    /// A request is valid iff `model` is non-empty and `messages` is non-empty.
    #[must_use]
    pub fn validate(&self) -> std::result::Result<(), crate::error::LlmError> {
        if self.model.trim().is_empty() {
            return Err(crate::error::LlmError::Validation {
                field: "model".to_owned(),
                message: "model must not be empty".to_owned(),
            });
        }
        if self.messages.is_empty() {
            return Err(crate::error::LlmError::Validation {
                field: "messages".to_owned(),
                message: "messages must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// Anthropic-specific shape validation: after extracting system messages,
    /// the first message must be from the user, and no two adjacent messages
    /// may share a role.
    pub fn validate_anthropic_alternation(&self) -> std::result::Result<(), crate::error::LlmError> {
        let non_system: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();

        if non_system.first().map_or(true, |m| m.role != Role::User) {
            return Err(crate::error::LlmError::Validation {
                field: "messages".to_owned(),
                message: "first non-system message must have role user".to_owned(),
            });
        }

        for pair in non_system.windows(2) {
            if pair[0].role == pair[1].role {
                return Err(crate::error::LlmError::Validation {
                    field: "messages".to_owned(),
                    message: "messages must alternate roles".to_owned(),
                });
            }
        }

        Ok(())
    }
}

/// A provider-neutral chat-completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response id.
    pub id: String,
    /// Model that produced the response.
    pub model: String,
    /// Assistant text content.
    pub content: String,
    /// Normalized finish reason.
    pub finish_reason: FinishReason,
    /// Token usage.
    pub usage: UsageStats,
    /// Tool calls emitted, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One chunk of a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Response id shared across all chunks of a stream.
    pub id: String,
    /// Model shared across all chunks of a stream.
    pub model: String,
    /// Incremental text delta.
    #[serde(default)]
    pub delta: String,
    /// Tool calls surfaced in this chunk, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Finish reason; present on at most one chunk in a stream.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finish_reason: Option<FinishReason>,
    /// Usage; present on at most one chunk (the final one) in a stream.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<UsageStats>,
    /// Set when the stream terminated due to an error.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Stateful health summary for one provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    /// Whether the provider is currently considered healthy.
    pub healthy: bool,
    /// Last time a health check or request touched this state.
    pub last_check: DateTime<Utc>,
    /// Consecutive failed requests.
    pub consecutive_failures: u32,
    /// Last observed error message, if any.
    pub last_error: Option<String>,
    /// Total requests observed.
    pub total_requests: u64,
    /// Total failed requests observed.
    pub failed_requests: u64,
    /// Last successful request time, if any.
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
            total_requests: 0,
            failed_requests: 0,
            last_success: None,
        }
    }
}

/// Circuit-breaker threshold: this many consecutive failures marks a
/// provider unhealthy.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

impl ProviderHealth {
    /// Record a successful request: resets the failure streak and marks healthy.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.healthy = true;
        self.total_requests = self.total_requests.saturating_add(1);
        let now = Utc::now();
        self.last_check = now;
        self.last_success = Some(now);
    }

    /// Record a failed request, tripping the circuit breaker at the threshold.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_requests = self.total_requests.saturating_add(1);
        self.failed_requests = self.failed_requests.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_check = Utc::now();
        if self.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
            self.healthy = false;
        }
    }
}

/// An entry in the routing engine's sticky cache.
#[derive(Debug, Clone)]
pub struct StickyEntry {
    /// Provider chosen for this key.
    pub provider: String,
    /// Time this entry was created.
    pub created_at: DateTime<Utc>,
    /// Time this entry was last accessed.
    pub last_accessed_at: DateTime<Utc>,
    /// Expiry time; `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of times this entry has been read or written.
    pub access_count: u64,
}

/// The policy-decision action for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Forward the request unmodified.
    Allow,
    /// Reject the request.
    Block,
    /// Forward a modified request.
    Transform,
    /// Forward to a specific routing target.
    Route,
}

/// A routing target named by a policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTarget {
    /// Preferred provider name.
    pub provider: String,
    /// Ordered fallback provider names.
    #[serde(default)]
    pub fallback: Vec<String>,
}

/// The decision returned by the policy-decision interface for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// The action to take.
    pub action: PolicyAction,
    /// Reason given when `action == Block`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block_reason: Option<String>,
    /// Routing target given when `action == Route`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub routing_target: Option<RoutingTarget>,
    /// Request transforms to apply when `action == Transform`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transforms: Option<serde_json::Value>,
    /// Commit-like version string identifying the policy that produced this decision.
    pub policy_version: String,
    /// Estimated cost of serving this request, independent of billing enforcement.
    #[serde(default)]
    pub cost_estimate: f64,
}

/// A durable, signed audit record describing one request/response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Record id.
    pub id: String,
    /// Time the originating request was received.
    pub request_timestamp: DateTime<Utc>,
    /// Caller user id.
    pub user_id: String,
    /// Caller API-key id (redacted if configured).
    pub api_key_id: String,
    /// Requested model.
    pub model: String,
    /// Provider the request was routed to.
    pub provider: String,
    /// Policy decision action.
    pub policy_decision: PolicyAction,
    /// Reason given when the decision was a block.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block_reason: Option<String>,
    /// Commit-like policy version string.
    pub policy_version: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens consumed.
    pub completion_tokens: u64,
    /// Total tokens (must equal prompt + completion).
    pub total_tokens: u64,
    /// Actual cost incurred.
    pub actual_cost: f64,
    /// Lowercase hex SHA-256 of the canonical request.
    pub request_hash: String,
    /// Lowercase hex SHA-256 of the canonical response.
    pub response_hash: String,
    /// Lowercase hex Ed25519 signature over the canonical record.
    pub signature: String,
    /// Id of the signing key used.
    pub signing_key_id: String,
}

/// Correlates one request end-to-end through logs and evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh, random request id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derived signals the policy layer may consult, attached to an incoming request.
#[derive(Debug, Clone)]
pub struct EnrichedRequest {
    /// Correlation id for this request.
    pub request_id: RequestId,
    /// The original request.
    pub request: CompletionRequest,
    /// Caller's user id.
    pub user: String,
    /// Caller's API-key id.
    pub api_key_id: String,
    /// Session id, if the caller supplied one.
    pub session_id: Option<String>,
    /// Estimated token count, derived without calling any provider.
    pub token_estimate: u64,
    /// One-line summary of the content for policy consumption.
    pub content_analysis_summary: String,
    /// Estimated cost of serving the request.
    pub cost_estimate: f64,
    /// Short summary of the conversation so far.
    pub conversation_summary: String,
}

/// Estimate token count as roughly four characters per token, summed over
/// all message content. A cheap, provider-independent heuristic used only
/// for policy enrichment, never for billing.
#[must_use]
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    u64::try_from(chars.div_ceil(4)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_model() {
        let req = CompletionRequest {
            model: String::new(),
            messages: vec![Message {
                role: Role::User,
                content: "hi".into(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
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
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn anthropic_alternation_rejects_two_user_messages() {
        let req = CompletionRequest {
            model: "claude-3".into(),
            messages: vec![
                Message {
                    role: Role::User,
                    content: "a".into(),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                Message {
                    role: Role::User,
                    content: "b".into(),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
            ],
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
        };
        let err = req.validate_anthropic_alternation().expect_err("alternation should be rejected");
        assert!(matches!(err, crate::error::LlmError::Validation { field, .. } if field == "messages"));
    }

    #[test]
    fn provider_health_trips_at_threshold() {
        let mut h = ProviderHealth::default();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD {
            h.record_failure("boom");
        }
        assert!(!h.healthy);
        assert_eq!(h.consecutive_failures, CIRCUIT_BREAKER_THRESHOLD);
        h.record_success();
        assert!(h.healthy);
        assert_eq!(h.consecutive_failures, 0);
    }

    #[test]
    fn usage_stats_total_matches_parts() {
        let u = UsageStats::new(10, 20);
        assert_eq!(u.total_tokens, 30);
    }
}
