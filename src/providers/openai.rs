//! OpenAI-shaped adapter: chat completions, `n=1` enforced, bearer auth.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::LlmError;
use crate::model::{
    CompletionRequest, CompletionResponse, FinishReason, Message, Role, StreamChunk, ToolCall,
    ToolCallFunction, UsageStats,
};
use crate::providers::http_core::{HttpCore, HttpCoreConfig};
use crate::providers::sse::SseDecoder;
use crate::providers::{LlmProvider, STREAM_CHANNEL_CAPACITY};

/// Configuration for one OpenAI-shaped adapter instance.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Adapter name, as configured.
    pub name: String,
    /// Base URL, e.g. `https://api.openai.com`.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// HTTP core tunables.
    pub http: HttpCoreConfig,
}

/// OpenAI chat-completions adapter.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    core: HttpCore,
}

impl OpenAiProvider {
    /// Build a new OpenAI adapter from validated configuration.
    ///
    /// # Errors
    /// Returns [`LlmError::Config`] if the underlying HTTP client fails to build.
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let core = HttpCore::new(&config.name, config.http.clone())?;
        Ok(Self { config, core })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut obj = json!({
                    "role": role_str(m.role),
                    "content": m.content,
                });
                if let Some(name) = &m.name {
                    obj["name"] = json!(name);
                }
                if let Some(tool_calls) = &m.tool_calls {
                    obj["tool_calls"] = json!(tool_calls
                        .iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": tc.kind,
                            "function": {"name": tc.function.name, "arguments": tc.function.arguments},
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "n": 1,
            "stream": stream,
        });

        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(mt) = request.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(stop) = &request.stop {
            body["stop"] = json!(stop);
        }
        if let Some(pp) = request.presence_penalty {
            body["presence_penalty"] = json!(pp);
        }
        if let Some(fp) = request.frequency_penalty {
            body["frequency_penalty"] = json!(fp);
        }
        if let Some(user) = &request.user {
            body["user"] = json!(user);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                }))
                .collect::<Vec<_>>());
        }

        body
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        request.validate()?;

        let body = Self::build_body(request, false);
        let url = self.endpoint();
        let api_key = self.config.api_key.clone();

        let resp = self
            .core
            .execute_with_retry(&self.config.name, move || {
                self.core
                    .client()
                    .post(&url)
                    .bearer_auth(&api_key)
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

        parse_openai_completion(&self.config.name, request.model.clone(), &parsed)
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        request.validate()?;

        let body = Self::build_body(request, true);
        let url = self.endpoint();
        let api_key = self.config.api_key.clone();
        let name = self.config.name.clone();

        let resp = self
            .core
            .execute_with_retry(&self.config.name, move || {
                self.core
                    .client()
                    .post(&url)
                    .bearer_auth(&api_key)
                    .json(&body)
            })
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut stream = resp.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(error_chunk(&name, e.to_string()))
                            .await;
                        return;
                    }
                };

                for event in decoder.feed(&chunk) {
                    if event.data.trim() == "[DONE]" {
                        return;
                    }
                    let value: Value = match serde_json::from_str(&event.data) {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = tx.send(error_chunk(&name, e.to_string())).await;
                            return;
                        }
                    };
                    if let Some(chunk) = parse_openai_stream_chunk(&value) {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        let api_key = self.config.api_key.clone();
        match self
            .core
            .execute_with_retry(&self.config.name, move || {
                self.core.client().get(&url).bearer_auth(&api_key)
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(provider = %self.config.name, error = %e, "health probe failed");
                Err(e)
            }
        }
    }

    fn health(&self) -> crate::model::ProviderHealth {
        self.core.health()
    }

    fn supported_models(&self) -> Option<&[String]> {
        None
    }

    async fn close(&self) {}
}

fn error_chunk(provider: &str, cause: String) -> StreamChunk {
    StreamChunk {
        id: String::new(),
        model: String::new(),
        delta: String::new(),
        tool_calls: None,
        finish_reason: None,
        usage: None,
        error: Some(format!("{provider}: {cause}")),
        created_at: Utc::now(),
    }
}

fn parse_openai_completion(
    provider: &str,
    model: String,
    value: &Value,
) -> Result<CompletionResponse, LlmError> {
    let parse_err = |cause: String| LlmError::Parse {
        provider: provider.to_owned(),
        raw_response: value.to_string(),
        cause,
    };

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| parse_err("missing choices[0]".to_owned()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| parse_err("missing choices[0].message".to_owned()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let tool_calls = message.get("tool_calls").and_then(Value::as_array).map(|arr| {
        arr.iter()
            .filter_map(|tc| {
                Some(ToolCall {
                    id: tc.get("id")?.as_str()?.to_owned(),
                    kind: "function".to_owned(),
                    function: ToolCallFunction {
                        name: tc.get("function")?.get("name")?.as_str()?.to_owned(),
                        arguments: tc.get("function")?.get("arguments")?.as_str()?.to_owned(),
                    },
                })
            })
            .collect::<Vec<_>>()
    });

    let finish_reason_raw = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");
    let finish_reason = FinishReason::normalize(finish_reason_raw).unwrap_or(FinishReason::Stop);

    let usage = value
        .get("usage")
        .map(|u| {
            UsageStats::new(
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        id,
        model,
        content,
        finish_reason,
        usage,
        tool_calls,
        created_at: Utc::now(),
        metadata: Default::default(),
    })
}

fn parse_openai_stream_chunk(value: &Value) -> Option<StreamChunk> {
    let id = value.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
    let model = value.get("model").and_then(Value::as_str).unwrap_or_default().to_owned();
    let choice = value.get("choices").and_then(Value::as_array).and_then(|c| c.first())?;
    let delta_obj = choice.get("delta");

    let delta = delta_obj
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .and_then(FinishReason::normalize);

    let usage = value.get("usage").map(|u| {
        UsageStats::new(
            u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        )
    });

    Some(StreamChunk {
        id,
        model,
        delta,
        tool_calls: None,
        finish_reason,
        usage,
        error: None,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_completion() {
        let value = serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        });
        let resp = parse_openai_completion("openai", "gpt-4o".to_owned(), &value).expect("should parse completion");
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.total_tokens, 7);
    }

    #[test]
    fn parses_stream_chunk_delta() {
        let value = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"delta": {"content": "Hello"}}],
        });
        let chunk = parse_openai_stream_chunk(&value).expect("should parse stream chunk");
        assert_eq!(chunk.delta, "Hello");
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn builds_request_body_with_tool_choice_and_n_one() {
        let req = CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![Message {
                role: Role::User,
                content: "hi".into(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            temperature: Some(0.2),
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
        let body = OpenAiProvider::build_body(&req, false);
        assert_eq!(body["n"], 1);
        assert_eq!(body["temperature"], 0.2);
    }
}
