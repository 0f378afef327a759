//! Hot-reloading certificate loader.
//!
//! Polls the configured cert/key file mtimes the way the teacher's log
//! watcher polls its JSONL directory for new content, and swaps a fresh
//! `rustls::sk::CertifiedKey` into an `ArcSwap` whenever either file changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use rustls::sign::CertifiedKey;
use tracing::{error, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::error::LlmError;
use crate::tls::EXPIRATION_WARNING_WINDOW;

/// Loads a cert/key pair from PEM files into a `rustls::sign::CertifiedKey`.
fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, LlmError> {
    let cert_bytes = fs::read(cert_path).map_err(|e| LlmError::Config {
        provider: "tls".to_owned(),
        field: "cert_path".to_owned(),
        message: e.to_string(),
    })?;
    let key_bytes = fs::read(key_path).map_err(|e| LlmError::Config {
        provider: "tls".to_owned(),
        field: "key_path".to_owned(),
        message: e.to_string(),
    })?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "cert_path".to_owned(),
            message: format!("failed to parse certificate chain: {e}"),
        })?;

    if certs.is_empty() {
        return Err(LlmError::Config {
            provider: "tls".to_owned(),
            field: "cert_path".to_owned(),
            message: "certificate chain is empty".to_owned(),
        });
    }

    warn_if_expiring_soon(certs[0].as_ref(), cert_path);

    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "key_path".to_owned(),
            message: format!("failed to parse private key: {e}"),
        })?
        .ok_or_else(|| LlmError::Config {
            provider: "tls".to_owned(),
            field: "key_path".to_owned(),
            message: "no private key found in file".to_owned(),
        })?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
        LlmError::Config {
            provider: "tls".to_owned(),
            field: "key_path".to_owned(),
            message: format!("unsupported private key type: {e}"),
        }
    })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Parse the leaf certificate's `notAfter` and log a warning if the
/// remaining validity window is under `EXPIRATION_WARNING_WINDOW`.
/// Parse failures are logged and otherwise ignored — expiration warning is
/// a diagnostic, not a gate on serving the certificate.
fn warn_if_expiring_soon(leaf_der: &[u8], cert_path: &Path) {
    let cert = match X509Certificate::from_der(leaf_der) {
        Ok((_, cert)) => cert,
        Err(e) => {
            warn!(cert = %cert_path.display(), error = %e, "failed to parse certificate for expiration check");
            return;
        }
    };

    let Some(not_after) = chrono::DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0) else {
        return;
    };

    let remaining = not_after - chrono::Utc::now();
    if remaining < EXPIRATION_WARNING_WINDOW {
        warn!(
            cert = %cert_path.display(),
            not_after = %not_after,
            remaining_days = remaining.num_days(),
            "TLS certificate expiring soon"
        );
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watches a cert/key pair on disk and republishes a `CertifiedKey` through
/// an `ArcSwap` whenever either file's mtime advances.
pub struct CertReloader {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: Arc<ArcSwap<CertifiedKey>>,
    last_cert_mtime: Option<SystemTime>,
    last_key_mtime: Option<SystemTime>,
}

impl CertReloader {
    /// Perform the initial load and return a reloader plus a shared handle
    /// to the live key, suitable for a `rustls::server::ResolvesServerCert`.
    ///
    /// # Errors
    /// Returns an error if the initial cert/key pair cannot be read or parsed.
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, LlmError> {
        let key = load_certified_key(&cert_path, &key_path)?;
        let last_cert_mtime = file_mtime(&cert_path);
        let last_key_mtime = file_mtime(&key_path);
        Ok(Self {
            cert_path,
            key_path,
            current: Arc::new(ArcSwap::new(Arc::new(key))),
            last_cert_mtime,
            last_key_mtime,
        })
    }

    /// A cloneable handle to the live certified key, safe to hand to a
    /// `rustls::ServerConfig`'s cert resolver.
    #[must_use]
    pub fn handle(&self) -> Arc<ArcSwap<CertifiedKey>> {
        self.current.clone()
    }

    /// Check file mtimes and reload if either has advanced since the last
    /// check. Returns `true` if a reload occurred.
    pub fn poll(&mut self) -> bool {
        let cert_mtime = file_mtime(&self.cert_path);
        let key_mtime = file_mtime(&self.key_path);

        let changed = cert_mtime != self.last_cert_mtime || key_mtime != self.last_key_mtime;
        if !changed {
            return false;
        }

        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(key) => {
                self.current.store(Arc::new(key));
                self.last_cert_mtime = cert_mtime;
                self.last_key_mtime = key_mtime;
                info!(cert = %self.cert_path.display(), "reloaded TLS certificate");
                true
            }
            Err(e) => {
                error!(cert = %self.cert_path.display(), error = %e, "failed to reload TLS certificate, keeping previous");
                false
            }
        }
    }

    /// Spawn a background task that polls on the given interval forever.
    pub fn spawn_poller(mut self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.poll();
            }
        })
    }
}
