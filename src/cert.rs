//! Self-signed certificate generation for framelink endpoints.
//!
//! Deployments that terminate TLS with real PKI material should load DER
//! bytes into [`TlsSettings`](crate::config::TlsSettings) directly; this
//! helper exists for the common self-signed case and for tests.

use rcgen::{CertificateParams, KeyPair, PKCS_ED25519};
use tracing::debug;

use crate::error::{LinkError, LinkResult};

/// Generate a self-signed Ed25519 certificate for `hostname`.
///
/// Returns `(cert_der, key_der)`, both DER-encoded and ready for
/// [`TlsSettings`](crate::config::TlsSettings).
pub fn generate_self_signed_cert(hostname: &str) -> LinkResult<(Vec<u8>, Vec<u8>)> {
    debug!(hostname, "generating self-signed certificate");

    let key_pair = KeyPair::generate_for(&PKCS_ED25519)
        .map_err(|e| LinkError::Tls(format!("key generation failed: {e}")))?;

    let params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| LinkError::Tls(format!("certificate params invalid: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| LinkError::Tls(format!("self-signing failed: {e}")))?;

    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
