//! Assembles a `rustls::ServerConfig` from a `TlsConfig`: minimum version,
//! AEAD-only cipher restriction, optional mTLS client verification, and a
//! cert resolver backed by the hot-reloading `CertReloader`. Also runs the
//! TLS-terminating accept loop handed the resulting config.

use std::future::Future;
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::error::LlmError;
use crate::tls::identity::extract_identity;

use super::{IdentityField, MinTlsVersion, MtlsMode, TlsConfig, RECOGNIZED_AEAD_SUITES};

/// Resolves the TLS certificate for every handshake from an `ArcSwap`
/// updated out-of-band by the cert reloader.
#[derive(Debug)]
pub struct HotReloadResolver {
    current: Arc<arc_swap::ArcSwap<CertifiedKey>>,
}

impl HotReloadResolver {
    /// Wrap a reloader's live-key handle as a `rustls` cert resolver.
    #[must_use]
    pub fn new(current: Arc<arc_swap::ArcSwap<CertifiedKey>>) -> Self {
        Self { current }
    }
}

impl ResolvesServerCert for HotReloadResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

fn load_ca_store(path: &str) -> Result<RootCertStore, LlmError> {
    let bytes = std::fs::read(path).map_err(|e| LlmError::Config {
        provider: "tls".to_owned(),
        field: "client_ca_path".to_owned(),
        message: e.to_string(),
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "client_ca_path".to_owned(),
            message: format!("failed to parse CA bundle: {e}"),
        })?;

    let mut store = RootCertStore::empty();
    for cert in certs {
        store.add(cert).map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "client_ca_path".to_owned(),
            message: format!("failed to add CA certificate: {e}"),
        })?;
    }
    Ok(store)
}

fn client_verifier(config: &TlsConfig) -> Result<Arc<dyn ClientCertVerifier>, LlmError> {
    let ca_path = config.client_ca_path.as_ref().ok_or_else(|| LlmError::Config {
        provider: "tls".to_owned(),
        field: "client_ca_path".to_owned(),
        message: "mTLS is enabled but no client_ca_path was configured".to_owned(),
    })?;

    let store = Arc::new(load_ca_store(ca_path)?);
    let builder = WebPkiClientVerifier::builder(store);

    let builder = match config.mtls_mode {
        MtlsMode::Require => builder,
        MtlsMode::Request | MtlsMode::VerifyIfGiven => builder.allow_unauthenticated(),
    };

    builder.build().map_err(|e| LlmError::Config {
        provider: "tls".to_owned(),
        field: "mtls_mode".to_owned(),
        message: format!("failed to build client verifier: {e}"),
    })
}

/// Build the `ring` crypto provider, restricting `cipher_suites` to
/// `allow_list` when one is configured. Names not in `RECOGNIZED_AEAD_SUITES`
/// are ignored; an allow-list that matches nothing recognized falls back to
/// the provider's full default suite set rather than leaving the server with
/// no usable suites at all.
fn filtered_provider(allow_list: Option<&[String]>) -> rustls::crypto::CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();

    let Some(allow_list) = allow_list else {
        return provider;
    };

    let filtered: Vec<_> = provider
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite());
            RECOGNIZED_AEAD_SUITES.contains(&name.as_str()) && allow_list.iter().any(|allowed| allowed == &name)
        })
        .collect();

    if filtered.is_empty() {
        warn!("cipher_allow_list matched no recognized AEAD suite; keeping default suite set");
        return provider;
    }

    provider.cipher_suites = filtered;
    provider
}

/// Build a `rustls::ServerConfig` honoring min version, AEAD cipher
/// restriction, and mTLS enforcement, with certs served from `resolver`.
///
/// # Errors
/// Returns an error if mTLS is enabled without a usable CA bundle, or the
/// underlying `rustls` config builder rejects the protocol version set.
pub fn build_server_config(
    config: &TlsConfig,
    resolver: Arc<HotReloadResolver>,
) -> Result<rustls::ServerConfig, LlmError> {
    let versions: &[&rustls::SupportedProtocolVersion] = match config.min_version {
        MinTlsVersion::V1_2 => &[&rustls::version::TLS12, &rustls::version::TLS13],
        MinTlsVersion::V1_3 => &[&rustls::version::TLS13],
    };

    let provider = Arc::new(filtered_provider(config.cipher_allow_list.as_deref()));

    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "min_version".to_owned(),
            message: e.to_string(),
        })?;

    let server_config = if config.mtls_enabled {
        builder
            .with_client_cert_verifier(client_verifier(config)?)
            .with_cert_resolver(resolver)
    } else {
        builder.with_no_client_auth().with_cert_resolver(resolver)
    };

    Ok(server_config)
}

/// Accept loop terminating TLS on every connection before handing the
/// decrypted stream to `app`. Runs until `shutdown` resolves; individual
/// connection and handshake failures are logged and do not stop the loop.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: axum::Router,
    identity_field: IdentityField,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, %peer_addr, "tls handshake failed");
                            return;
                        }
                    };

                    if let Some(chain) = tls_stream.get_ref().1.peer_certificates() {
                        if let Some(leaf) = chain.first() {
                            match extract_identity(leaf.as_ref(), identity_field) {
                                Some(identity) => {
                                    tracing::debug!(%peer_addr, identity = %identity.value, "mTLS client authenticated");
                                }
                                None => warn!(%peer_addr, "mTLS certificate presented but identity field missing"),
                            }
                        }
                    }

                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        warn!(error = %e, %peer_addr, "connection closed with error");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls12_request_includes_both_versions() {
        let versions: &[&rustls::SupportedProtocolVersion] =
            match MinTlsVersion::V1_2 {
                MinTlsVersion::V1_2 => &[&rustls::version::TLS12, &rustls::version::TLS13],
                MinTlsVersion::V1_3 => &[&rustls::version::TLS13],
            };
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn filtered_provider_restricts_to_the_allow_list() {
        let full = filtered_provider(None);
        let allow_list = vec!["TLS13_AES_256_GCM_SHA384".to_owned()];
        let restricted = filtered_provider(Some(&allow_list));

        assert!(restricted.cipher_suites.len() < full.cipher_suites.len());
        assert!(restricted
            .cipher_suites
            .iter()
            .all(|suite| format!("{:?}", suite.suite()) == "TLS13_AES_256_GCM_SHA384"));
    }

    #[test]
    fn filtered_provider_falls_back_when_nothing_recognized_matches() {
        let full = filtered_provider(None);
        let allow_list = vec!["NOT_A_REAL_SUITE".to_owned()];
        let restricted = filtered_provider(Some(&allow_list));

        assert_eq!(restricted.cipher_suites.len(), full.cipher_suites.len());
    }
}
