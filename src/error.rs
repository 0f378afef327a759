//! Crate-wide error taxonomy.
//!
//! Every failure that can cross an adapter, routing, or evidence boundary is
//! represented here. `Display` never includes secret material or the raw
//! upstream response body — the raw body is carried as a struct field for
//! callers that explicitly want to inspect it (e.g. the evidence layer),
//! never surfaced through formatting.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Named failure kinds carried end-to-end through the pipeline.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Generic provider failure; carries the upstream HTTP status.
    #[error("provider error ({status}): {message}")]
    Provider {
        /// HTTP status returned by the upstream, if any.
        status: Option<u16>,
        /// Short, secret-free description.
        message: String,
    },

    /// Authentication rejected by the upstream (401/403).
    #[error("authentication failed for provider {provider}")]
    Auth {
        /// Provider name.
        provider: String,
    },

    /// Upstream rate limit (429).
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit {
        /// Delay the caller should wait before retrying, if parseable.
        retry_after: Option<Duration>,
    },

    /// A deadline was exceeded.
    #[error("timed out after {configured:?}")]
    Timeout {
        /// The timeout that was configured for the call.
        configured: Duration,
    },

    /// Failure to parse an upstream response.
    #[error("failed to parse response from {provider}: {cause}")]
    Parse {
        /// Provider name.
        provider: String,
        /// Raw response body. Never included in `Display`.
        raw_response: String,
        /// Parse failure description.
        cause: String,
    },

    /// The requested model is not known to the named provider.
    #[error("model {model} not found on provider {provider}")]
    ModelNotFound {
        /// Provider name.
        provider: String,
        /// Requested model id.
        model: String,
    },

    /// A request failed shape validation before any network I/O occurred.
    #[error("validation failed on field {field}: {message}")]
    Validation {
        /// Offending field name.
        field: String,
        /// Human-readable description.
        message: String,
    },

    /// A streaming read failed mid-stream.
    #[error("stream error: {cause}")]
    Stream {
        /// Underlying cause description.
        cause: String,
    },

    /// A provider was misconfigured.
    #[error("config error for provider {provider}, field {field}: {message}")]
    Config {
        /// Provider name.
        provider: String,
        /// Offending config field.
        field: String,
        /// Human-readable description.
        message: String,
    },

    /// No provider in the filtered candidate set exposes the requested model.
    #[error("no provider supports model {model}")]
    ModelNotSupported {
        /// Requested model id.
        model: String,
    },

    /// The candidate set was emptied by health filtering.
    #[error("no healthy providers available")]
    NoHealthyProviders,

    /// A manually-selected provider does not exist or was filtered out.
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// All providers in a fallback chain failed.
    #[error("all providers failed, last cause: {cause}")]
    AllProvidersFailed {
        /// Description of the final failure.
        cause: String,
    },

    /// Evidence storage failure.
    #[error("evidence storage error: {0}")]
    Storage(String),
}

impl LlmError {
    /// True if this error kind is retriable by the HTTP core's retry loop.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, LlmError::Provider { .. } | LlmError::Timeout { .. })
    }

    /// Short machine-readable kind label, used as the `type` field on the
    /// JSON error envelope returned to callers.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            LlmError::Provider { .. } => "provider_error",
            LlmError::Auth { .. } => "authentication_error",
            LlmError::RateLimit { .. } => "rate_limit_error",
            LlmError::Timeout { .. } => "timeout",
            LlmError::Parse { .. } => "parse_error",
            LlmError::ModelNotFound { .. } | LlmError::ModelNotSupported { .. } => "model_not_found",
            LlmError::Validation { .. } => "invalid_request_error",
            LlmError::Stream { .. } => "stream_error",
            LlmError::Config { .. } => "config_error",
            LlmError::NoHealthyProviders => "no_healthy_providers",
            LlmError::ProviderNotFound(_) => "not_found",
            LlmError::AllProvidersFailed { .. } => "all_providers_failed",
            LlmError::Storage(_) => "storage_error",
        }
    }
}
