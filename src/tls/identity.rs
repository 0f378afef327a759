//! Client identity extraction from a verified peer certificate.

use rustls::server::danger::ClientCertVerifier;
use rustls_pki_types::{CertificateDer, UnixTime};
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::error::LlmError;

use super::IdentityField;

/// The caller identity derived from an mTLS client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The raw value extracted from the configured identity field.
    pub value: String,
    /// Which field it came from.
    pub field: IdentityField,
}

/// Extract the configured identity field from a DER-encoded client
/// certificate. Returns `None` if the field is absent or the certificate
/// cannot be parsed.
#[must_use]
pub fn extract_identity(der: &[u8], field: IdentityField) -> Option<ClientIdentity> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| warn!(error = %e, "failed to parse client certificate"))
        .ok()?;

    let value = match field {
        IdentityField::SubjectCn => subject_attr(&cert, "CN"),
        IdentityField::SubjectOu => subject_attr(&cert, "OU"),
        IdentityField::SubjectO => subject_attr(&cert, "O"),
        IdentityField::San => first_dns_san(&cert),
    }?;

    Some(ClientIdentity { value, field })
}

/// Validates a client certificate chain against the configured CA pool and
/// checks that the current time falls within the leaf's validity window,
/// using the same `ClientCertVerifier` wired into the TLS server config.
/// This is the same check `rustls` performs during the handshake; exposed
/// standalone so a captured chain can be re-checked outside a live
/// connection (audit tooling, tests).
///
/// # Errors
/// Returns an error if the chain does not terminate at a trusted CA, or the
/// leaf is expired or not yet valid.
pub fn validate_client_certificate(
    verifier: &dyn ClientCertVerifier,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<(), LlmError> {
    verifier
        .verify_client_cert(end_entity, intermediates, UnixTime::now())
        .map(|_| ())
        .map_err(|e| LlmError::Config {
            provider: "tls".to_owned(),
            field: "client_ca_path".to_owned(),
            message: format!("client certificate validation failed: {e}"),
        })
}

fn subject_attr(cert: &X509Certificate<'_>, short_name: &str) -> Option<String> {
    let target = match short_name {
        "CN" => &x509_parser::oid_registry::OID_X509_COMMON_NAME,
        "OU" => &x509_parser::oid_registry::OID_X509_ORGANIZATIONAL_UNIT,
        "O" => &x509_parser::oid_registry::OID_X509_ORGANIZATION_NAME,
        _ => return None,
    };
    cert.subject()
        .iter_attributes()
        .find(|attr| attr.attr_type() == target)
        .and_then(|attr| attr.as_str().ok())
        .map(ToOwned::to_owned)
}

fn first_dns_san(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert
        .extensions()
        .iter()
        .find_map(|ext| ext.parsed_extension().as_subjectalternativename().ok())?;

    san.general_names.iter().find_map(|name| match name {
        GeneralName::DNSName(dns) => Some((*dns).to_owned()),
        _ => None,
    })
}
