//! Configuration loading and validation.
//!
//! A single TOML file declares the whole proxy: listen address, TLS edge,
//! per-provider adapter settings, policy integration, evidence pipeline, and
//! telemetry. Every section has field-level defaults so a minimal file only
//! needs `providers.*`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tls::TlsConfig;

/// Top-level configuration, deserialized from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxy listener settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Edge security settings (TLS, mTLS).
    #[serde(default)]
    pub security: SecurityConfig,

    /// Per-provider adapter configuration, keyed by provider name.
    pub providers: HashMap<String, ProviderConfig>,

    /// Routing engine settings.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Policy-decision integration settings.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Evidence pipeline settings.
    #[serde(default)]
    pub evidence: EvidenceConfig,

    /// Telemetry/logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// `proxy.*`
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address the HTTP(S) listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Grace period, in seconds, for in-flight requests during shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8443".to_owned()
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// `security.*`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// TLS edge configuration.
    pub tls: Option<TlsConfig>,
}

/// `providers.<name>.*`
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Adapter kind: `openai`, `anthropic`, or `generic`.
    pub kind: String,

    /// Base URL for the provider's API.
    pub base_url: String,

    /// API key, typically sourced from an environment variable at load time.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout: u64,

    /// Maximum retry attempts for retriable failures.
    #[serde(default = "default_provider_max_retries")]
    pub max_retries: u32,

    /// Explicit routing weight for round-robin strategies.
    #[serde(default = "default_provider_weight")]
    pub weight: i32,

    /// Models this provider is allowed to serve; unset means unrestricted.
    #[serde(default)]
    pub models: Option<Vec<String>>,
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_provider_max_retries() -> u32 {
    3
}

fn default_provider_weight() -> i32 {
    1
}

/// `routing.*`
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Base strategy: `round_robin` or `manual`.
    #[serde(default = "default_routing_strategy")]
    pub strategy: String,

    /// Require the health-filter decorator to error on an empty healthy set,
    /// rather than degrading to the unfiltered candidate list.
    #[serde(default = "default_true")]
    pub require_healthy: bool,

    /// Fallback provider used when routing would otherwise fail.
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Sticky-session cache settings; absent disables stickiness.
    #[serde(default)]
    pub sticky: Option<StickyConfig>,

    /// Model-to-providers capability map; a model with no entry is served by
    /// every provider.
    #[serde(default)]
    pub model_capabilities: HashMap<String, Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: default_routing_strategy(),
            require_healthy: true,
            default_provider: None,
            sticky: None,
            model_capabilities: HashMap::new(),
        }
    }
}

fn default_routing_strategy() -> String {
    "round_robin".to_owned()
}

/// `routing.sticky.*`
#[derive(Debug, Clone, Deserialize)]
pub struct StickyConfig {
    /// Maximum entries retained before LRU eviction.
    #[serde(default = "default_sticky_capacity")]
    pub capacity: usize,

    /// Entry time-to-live, in seconds; `None` disables expiry.
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Key derivation strategy: `user`, `api_key`, `session`, or `composite`.
    #[serde(default = "default_sticky_key_type")]
    pub key_type: String,
}

fn default_sticky_capacity() -> usize {
    10_000
}

fn default_sticky_key_type() -> String {
    "composite".to_owned()
}

/// `policy.*`
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Policy evaluation mode: `allow_all`, `fail_open`, or `fail_closed`.
    #[serde(default = "default_policy_mode")]
    pub mode: String,

    /// Path to an externally-owned policy source file, if the policy
    /// collaborator reads one. Opaque to the proxy itself.
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: default_policy_mode(),
            file_path: None,
        }
    }
}

fn default_policy_mode() -> String {
    "fail_open".to_owned()
}

/// `evidence.*`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvidenceConfig {
    /// Master on/off switch for the evidence pipeline.
    #[serde(default)]
    pub enabled: bool,

    /// Storage backend: `sqlite` or `memory`.
    #[serde(default = "default_evidence_backend")]
    pub backend: String,

    /// SQLite backend settings, used when `backend = "sqlite"`.
    #[serde(default)]
    pub sqlite: SqliteSection,

    /// Recorder queue tunables.
    #[serde(default)]
    pub recorder: RecorderSection,

    /// Retention pruning tunables.
    #[serde(default)]
    pub retention: RetentionSection,
}

fn default_evidence_backend() -> String {
    "sqlite".to_owned()
}

/// `evidence.sqlite.*`
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteSection {
    /// Filesystem path to the SQLite database.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// Maximum open connections in the pool.
    #[serde(default = "default_sqlite_max_open")]
    pub max_open_conns: u32,

    /// Maximum idle connections retained in the pool.
    #[serde(default = "default_sqlite_max_idle")]
    pub max_idle_conns: u32,

    /// Enable WAL journal mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_sqlite_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for SqliteSection {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            max_open_conns: default_sqlite_max_open(),
            max_idle_conns: default_sqlite_max_idle(),
            wal_mode: true,
            busy_timeout_ms: default_sqlite_busy_timeout(),
        }
    }
}

fn default_sqlite_path() -> String {
    "evidence.db".to_owned()
}

fn default_sqlite_max_open() -> u32 {
    8
}

fn default_sqlite_max_idle() -> u32 {
    2
}

fn default_sqlite_busy_timeout() -> u64 {
    5_000
}

/// `evidence.recorder.*`
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderSection {
    /// Bounded channel capacity between request handlers and the writer task.
    #[serde(default = "default_recorder_buffer_size")]
    pub buffer_size: usize,

    /// Per-write timeout, in milliseconds, applied to the storage backend.
    #[serde(default = "default_recorder_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Hash request bodies into the evidence record.
    #[serde(default = "default_true")]
    pub hash_request: bool,

    /// Hash response bodies into the evidence record.
    #[serde(default = "default_true")]
    pub hash_response: bool,

    /// Redact API keys before hashing/storing.
    #[serde(default = "default_true")]
    pub redact_api_keys: bool,

    /// Maximum length, in bytes, of any single recorded text field.
    #[serde(default = "default_recorder_max_field_length")]
    pub max_field_length: usize,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            buffer_size: default_recorder_buffer_size(),
            write_timeout_ms: default_recorder_write_timeout_ms(),
            hash_request: true,
            hash_response: true,
            redact_api_keys: true,
            max_field_length: default_recorder_max_field_length(),
        }
    }
}

fn default_recorder_buffer_size() -> usize {
    1_000
}

fn default_recorder_write_timeout_ms() -> u64 {
    2_000
}

fn default_recorder_max_field_length() -> usize {
    8_192
}

/// `evidence.retention.*`
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    /// Retention window, in days.
    #[serde(default = "default_retention_days")]
    pub days: u32,

    /// Cron expression evaluated for scheduled pruning.
    #[serde(default = "default_prune_schedule")]
    pub prune_schedule: String,

    /// Archive expiring records before deleting them.
    #[serde(default)]
    pub archive_before_delete: bool,

    /// Archive destination, required when `archive_before_delete` is set.
    #[serde(default)]
    pub archive_path: Option<String>,

    /// Optional absolute cap on total retained records.
    #[serde(default)]
    pub max_records: Option<u64>,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            prune_schedule: default_prune_schedule(),
            archive_before_delete: false,
            archive_path: None,
            max_records: None,
        }
    }
}

fn default_retention_days() -> u32 {
    90
}

fn default_prune_schedule() -> String {
    "0 0 3 * * *".to_owned()
}

/// `telemetry.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Directory for rotated structured log files; `None` logs to stdout only.
    #[serde(default)]
    pub logs_dir: Option<String>,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit logs as JSON instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            logs_dir: None,
            log_filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Structural checks beyond what `serde` defaults can express: every
/// provider's `base_url` must be a well-formed absolute URL.
fn validate(config: &Config) -> anyhow::Result<()> {
    for (name, provider) in &config.providers {
        url::Url::parse(&provider.base_url)
            .map_err(|e| anyhow::anyhow!("provider '{name}' has an invalid base_url '{}': {e}", provider.base_url))?;
    }
    Ok(())
}
