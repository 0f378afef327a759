//! Anthropic Messages adapter: system-message extraction, alternation
//! validation, and the `event:`/`data:` labeled SSE protocol.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::model::{
    CompletionRequest, CompletionResponse, FinishReason, Role, StreamChunk, ToolCall,
    ToolCallFunction, UsageStats,
};
use crate::providers::http_core::{HttpCore, HttpCoreConfig};
use crate::providers::sse::SseDecoder;
use crate::providers::{LlmProvider, STREAM_CHANNEL_CAPACITY};

/// Default `max_tokens` applied when the caller does not supply one, per
/// the Anthropic transform rule.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic API version header value this adapter speaks.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Configuration for one Anthropic adapter instance.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// Adapter name, as configured.
    pub name: String,
    /// Base URL, e.g. `https://api.anthropic.com`.
    pub base_url: String,
    /// `x-api-key` value.
    pub api_key: String,
    /// HTTP core tunables.
    pub http: HttpCoreConfig,
}

/// Anthropic Messages API adapter.
pub struct AnthropicProvider {
    config: AnthropicConfig,
    core: HttpCore,
}

impl AnthropicProvider {
    /// Build a new Anthropic adapter from validated configuration.
    ///
    /// # Errors
    /// Returns [`LlmError::Config`] if the underlying HTTP client fails to build.
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        let core = HttpCore::new(&config.name, config.http.clone())?;
        Ok(Self { config, core })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Extract system text and build the request body. Validates alternation
    /// first, per the spec's "no network I/O on validation failure" rule.
    fn build_body(request: &CompletionRequest, stream: bool) -> Result<Value, LlmError> {
        request.validate_anthropic_alternation()?;

        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": m.content,
                })
            })
            .collect();

        let max_tokens = match request.max_tokens {
            Some(0) | None => DEFAULT_MAX_TOKENS,
            Some(n) => n,
        };

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": stream,
        });

        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = json!(stop);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>());
        }

        Ok(body)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        request.validate()?;
        let body = Self::build_body(request, false)?;
        let url = self.endpoint();
        let api_key = self.config.api_key.clone();

        let resp = self
            .core
            .execute_with_retry(&self.config.name, move || {
                self.core
                    .client()
                    .post(&url)
                    .header("x-api-key", &api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            })
            .await?;

        let raw = resp.text().await.map_err(|e| LlmError::Parse {
            provider: self.config.name.clone(),
            raw_response: String::new(),
            cause: e.to_string(),
        })?;

        let parsed: Value = serde_json::from_str(&raw).map_err(|e| LlmError::Parse {
            provider: self.config.name.clone(),
            raw_response: raw.clone(),
            cause: e.to_string(),
        })?;

        parse_anthropic_completion(&self.config.name, request.model.clone(), &parsed)
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        request.validate()?;
        let body = Self::build_body(request, true)?;
        let url = self.endpoint();
        let api_key = self.config.api_key.clone();
        let name = self.config.name.clone();

        let resp = self
            .core
            .execute_with_retry(&self.config.name, move || {
                self.core
                    .client()
                    .post(&url)
                    .header("x-api-key", &api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            })
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut stream = resp.bytes_stream();
            let mut id = String::new();
            let mut model = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(error_chunk(&id, &model, e.to_string())).await;
                        return;
                    }
                };

                for event in decoder.feed(&chunk) {
                    let Some(label) = event.event.as_deref() else {
                        continue;
                    };

                    let value: Value = match serde_json::from_str(&event.data) {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = tx.send(error_chunk(&id, &model, e.to_string())).await;
                            return;
                        }
                    };

                    match label {
                        "message_start" => {
                            if let Some(msg) = value.get("message") {
                                id = msg.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
                                model = msg.get("model").and_then(Value::as_str).unwrap_or_default().to_owned();
                            }
                        }
                        "content_block_start" | "content_block_stop" | "ping" => {}
                        "content_block_delta" => {
                            if let Some(text) = value
                                .get("delta")
                                .and_then(|d| d.get("text"))
                                .and_then(Value::as_str)
                            {
                                let chunk = StreamChunk {
                                    id: id.clone(),
                                    model: model.clone(),
                                    delta: text.to_owned(),
                                    tool_calls: None,
                                    finish_reason: None,
                                    usage: None,
                                    error: None,
                                    created_at: Utc::now(),
                                };
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "message_delta" => {
                            let finish_reason = value
                                .get("delta")
                                .and_then(|d| d.get("stop_reason"))
                                .and_then(Value::as_str)
                                .and_then(FinishReason::normalize);
                            let usage = value.get("usage").map(|u| {
                                UsageStats::new(
                                    u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                                    u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                                )
                            });
                            let chunk = StreamChunk {
                                id: id.clone(),
                                model: model.clone(),
                                delta: String::new(),
                                tool_calls: None,
                                finish_reason,
                                usage,
                                error: None,
                                created_at: Utc::now(),
                            };
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        "message_stop" => return,
                        _ => {}
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        // Anthropic has no unauthenticated health endpoint; treat a minimal
        // non-streaming request to the messages endpoint as the probe by
        // relying on the circuit breaker from ordinary traffic instead.
        Ok(())
    }

    fn health(&self) -> crate::model::ProviderHealth {
        self.core.health()
    }

    fn supported_models(&self) -> Option<&[String]> {
        None
    }

    async fn close(&self) {}
}

fn error_chunk(id: &str, model: &str, cause: String) -> StreamChunk {
    StreamChunk {
        id: id.to_owned(),
        model: model.to_owned(),
        delta: String::new(),
        tool_calls: None,
        finish_reason: None,
        usage: None,
        error: Some(cause),
        created_at: Utc::now(),
    }
}

fn parse_anthropic_completion(
    provider: &str,
    model: String,
    value: &Value,
) -> Result<CompletionResponse, LlmError> {
    let parse_err = |cause: String| LlmError::Parse {
        provider: provider.to_owned(),
        raw_response: value.to_string(),
        cause,
    };

    let id = value.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();

    let blocks = value
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| parse_err("missing content array".to_owned()))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    content.push_str(t);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_owned(),
                    function: ToolCallFunction {
                        name,
                        arguments: input.to_string(),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = value
        .get("stop_reason")
        .and_then(Value::as_str)
        .and_then(FinishReason::normalize)
        .unwrap_or(FinishReason::Stop);

    let usage = value
        .get("usage")
        .map(|u| {
            UsageStats::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        id,
        model,
        content,
        finish_reason,
        usage,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        created_at: Utc::now(),
        metadata: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_owned(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn build_body_extracts_system_and_defaults_max_tokens() {
        let req = CompletionRequest {
            model: "claude-3-opus".into(),
            messages: vec![msg(Role::System, "be terse"), msg(Role::User, "hi")],
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
            metadata: Default::default(),
        };
        let body = AnthropicProvider::build_body(&req, false).expect("should build body");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().expect("messages should be array").len(), 1);
    }

    #[test]
    fn build_body_rejects_non_alternating_messages() {
        let req = CompletionRequest {
            model: "claude-3-opus".into(),
            messages: vec![msg(Role::User, "a"), msg(Role::User, "b")],
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
            metadata: Default::default(),
        };
        assert!(AnthropicProvider::build_body(&req, false).is_err());
    }

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let value = serde_json::json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "the weather is "},
                {"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {"city": "SF"}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let resp = parse_anthropic_completion("anthropic", "claude-3-opus".into(), &value).expect("should parse completion");
        assert_eq!(resp.content, "the weather is ");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.expect("tool_calls should be present").len(), 1);
    }
}
