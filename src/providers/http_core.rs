//! Pooled HTTP client, retry with exponential backoff, and provider health
//! accounting shared by every adapter.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::model::ProviderHealth;

/// Tunables for one provider's pooled HTTP client and retry behavior.
#[derive(Debug, Clone)]
pub struct HttpCoreConfig {
    /// Maximum idle connections kept per host.
    pub max_idle_per_host: usize,
    /// How long an idle pooled connection is kept before being closed.
    pub idle_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
}

impl Default for HttpCoreConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

/// Shared HTTP plumbing: client, retry loop, and health state for one
/// provider adapter. Never shared across providers.
pub struct HttpCore {
    client: Client,
    config: HttpCoreConfig,
    health: Mutex<ProviderHealth>,
}

impl HttpCore {
    /// Build a new HTTP core from configuration.
    ///
    /// # Errors
    /// Returns [`LlmError::Config`] if the underlying client cannot be built.
    pub fn new(provider: &str, config: HttpCoreConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Config {
                provider: provider.to_owned(),
                field: "http_client".to_owned(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            config,
            health: Mutex::new(ProviderHealth::default()),
        })
    }

    /// The underlying pooled client, for adapters building requests directly.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> ProviderHealth {
        self.health.lock().clone()
    }

    /// Execute `build` (called fresh on every attempt, since a request body
    /// cannot be replayed once consumed) with retry/backoff per §4.2, then
    /// pass the successful response to `on_success` for provider-specific
    /// body handling. Updates health accounting as a side effect.
    pub async fn execute_with_retry<B>(
        &self,
        provider: &str,
        mut build: B,
    ) -> Result<reqwest::Response, LlmError>
    where
        B: FnMut() -> reqwest::RequestBuilder,
    {
        let max_attempts = 1 + self.config.max_retries;
        let deadline = Instant::now() + self.config.request_timeout * max_attempts.max(1);
        let mut last_cause: Option<LlmError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let backoff = Duration::from_secs(1u64 << (attempt - 2));
                if Instant::now() + backoff > deadline {
                    self.record_failure(provider, "deadline exceeded during backoff");
                    return Err(LlmError::Timeout {
                        configured: self.config.request_timeout,
                    });
                }
                debug!(provider, attempt, ?backoff, "retrying after backoff");
                tokio::time::sleep(backoff).await;
            }

            let result = build().send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.record_success(provider);
                        return Ok(resp);
                    }

                    match classify_status(status, &resp) {
                        ImmediateError::Retriable => {
                            let body = resp.text().await.unwrap_or_default();
                            last_cause = Some(LlmError::Provider {
                                status: Some(status.as_u16()),
                                message: sanitize_body(&body),
                            });
                            self.record_failure(provider, "retriable status");
                            continue;
                        }
                        ImmediateError::Terminal(err) => {
                            self.record_failure(provider, "non-retriable status");
                            return Err(err);
                        }
                    }
                }
                Err(e) => {
                    last_cause = Some(LlmError::Provider {
                        status: None,
                        message: e.to_string(),
                    });
                    self.record_failure(provider, "transport error");
                }
            }
        }

        Err(last_cause.unwrap_or(LlmError::Provider {
            status: None,
            message: "exhausted retries".to_owned(),
        }))
    }

    fn record_success(&self, provider: &str) {
        let mut h = self.health.lock();
        h.record_success();
        debug!(provider, "request succeeded");
    }

    fn record_failure(&self, provider: &str, reason: &str) {
        let mut h = self.health.lock();
        h.record_failure(reason);
        if !h.healthy {
            warn!(provider, "circuit breaker tripped, provider marked unhealthy");
        }
    }
}

enum ImmediateError {
    Retriable,
    Terminal(LlmError),
}

fn classify_status(status: StatusCode, resp: &reqwest::Response) -> ImmediateError {
    match status.as_u16() {
        400 => ImmediateError::Terminal(LlmError::Provider {
            status: Some(400),
            message: "bad request".to_owned(),
        }),
        401 | 403 => ImmediateError::Terminal(LlmError::Auth {
            provider: String::new(),
        }),
        429 => {
            let retry_after = parse_retry_after(resp);
            ImmediateError::Terminal(LlmError::RateLimit { retry_after })
        }
        // 404 may indicate a transiently absent server; treated as retriable
        // per the literal spec contract, not demoted to ModelNotFound.
        404 | 500..=599 => ImmediateError::Retriable,
        _ => ImmediateError::Terminal(LlmError::Provider {
            status: Some(status.as_u16()),
            message: format!("unexpected status {status}"),
        }),
    }
}

/// Parse `Retry-After` as either integer seconds or an HTTP-date.
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let value = resp.headers().get("retry-after")?.to_str().ok()?;

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let target = httpdate::parse_http_date(value).ok()?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok()
}

/// Strip anything that looks like a bearer token or API key before the body
/// can end up in a log line or error message.
fn sanitize_body(body: &str) -> String {
    let re = SECRET_PATTERN.with(|re| re.clone());
    let redacted = re.replace_all(body, "[REDACTED]");
    if redacted.len() > 256 {
        format!("{}...[truncated]", &redacted[..256])
    } else {
        redacted.into_owned()
    }
}

thread_local! {
    static SECRET_PATTERN: Arc<regex::Regex> = Arc::new(
        regex::Regex::from_str(
            r"(sk-ant-[A-Za-z0-9_\-]{10,}|sk-[A-Za-z0-9]{32,}|Bearer\s+[A-Za-z0-9._\-]+)",
        )
        .expect("static secret-redaction pattern is valid"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_redacts_bearer_tokens() {
        let body = r#"{"error":"unauthorized","token":"Bearer sk-abcdefghijklmnopqrstuvwxyz0123456789"}"#;
        let out = sanitize_body(body);
        assert!(!out.contains("sk-abcdefghijklmnopqrstuvwxyz0123456789"));
    }

    #[test]
    fn sanitize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let out = sanitize_body(&body);
        assert!(out.len() < 1000);
        assert!(out.ends_with("...[truncated]"));
    }
}
