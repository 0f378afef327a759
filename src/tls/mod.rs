//! TLS edge: server config, hot-reloading cert loader, and mTLS identity
//! extraction.

pub mod identity;
pub mod reload;
pub mod server;

use serde::{Deserialize, Serialize};

/// Minimum negotiable TLS version. 1.0/1.1 are rejected outright; an
/// unrecognized value falls through to 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinTlsVersion {
    /// TLS 1.2.
    #[serde(rename = "1.2")]
    V1_2,
    /// TLS 1.3 (default).
    #[serde(rename = "1.3")]
    V1_3,
}

impl Default for MinTlsVersion {
    fn default() -> Self {
        Self::V1_3
    }
}

/// mTLS enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtlsMode {
    /// Client certificate is mandatory.
    Require,
    /// Client certificate is requested but not mandatory.
    Request,
    /// Client certificate is verified only if the client presents one.
    VerifyIfGiven,
}

impl Default for MtlsMode {
    fn default() -> Self {
        Self::Require
    }
}

/// Which field of the peer certificate identifies the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityField {
    /// Subject common name.
    SubjectCn,
    /// Subject organizational unit.
    SubjectOu,
    /// Subject organization.
    SubjectO,
    /// Subject alternative name.
    San,
}

/// TLS edge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS termination is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Path to the PEM certificate chain.
    pub cert_path: String,
    /// Path to the PEM private key.
    pub key_path: String,
    /// Minimum negotiable TLS version.
    #[serde(default)]
    pub min_version: MinTlsVersion,
    /// Optional allow-list of cipher suite names; only AEAD suites are recognized.
    #[serde(default)]
    pub cipher_allow_list: Option<Vec<String>>,
    /// Whether mTLS is enabled.
    #[serde(default)]
    pub mtls_enabled: bool,
    /// mTLS enforcement mode.
    #[serde(default)]
    pub mtls_mode: MtlsMode,
    /// Path to the CA bundle used to validate client certificates.
    #[serde(default)]
    pub client_ca_path: Option<String>,
    /// Which peer certificate field to use as the caller's identity.
    #[serde(default = "default_identity_field")]
    pub identity_field: IdentityField,
    /// Interval, in seconds, at which the cert reloader polls file mtimes.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_identity_field() -> IdentityField {
    IdentityField::SubjectCn
}

fn default_poll_interval_secs() -> u64 {
    30
}

/// AEAD cipher suite names this edge recognizes; anything else in a
/// configured allow-list is ignored.
pub const RECOGNIZED_AEAD_SUITES: &[&str] = &[
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_AES_128_GCM_SHA256",
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// Remaining certificate validity below this threshold triggers an
/// expiration warning.
pub const EXPIRATION_WARNING_WINDOW: chrono::Duration = chrono::Duration::days(30);
