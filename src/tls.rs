//! TLS configuration for framelink endpoints.
//!
//! Both sides negotiate TLS 1.3 or 1.2 with the ring provider and the
//! `framelink/1` ALPN. When `accept_invalid_certificates` is set (the
//! default), chain validation is replaced by verifiers that accept any
//! presented certificate; otherwise the peer must chain to the configured
//! trust anchor. Mutual authentication makes the client certificate
//! mandatory during the server handshake.

use std::fmt::Debug;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, Error, RootCertStore, ServerConfig,
    SignatureScheme,
};

use crate::config::TlsSettings;
use crate::error::{LinkError, LinkResult};

/// ALPN protocol identifier negotiated by framelink endpoints.
const ALPN_FRAMELINK: &[u8] = b"framelink/1";

fn tls_err(e: impl std::fmt::Display) -> LinkError {
    LinkError::Tls(e.to_string())
}

// ---------------------------------------------------------------------------
// Server-side: permissive ClientCertVerifier
// ---------------------------------------------------------------------------

/// A client certificate verifier that accepts any presented certificate
/// while still requiring one to be presented.
///
/// Used for mutual authentication when `accept_invalid_certificates` is set:
/// the handshake proves the client holds the key for *some* certificate, and
/// any trust decision beyond that belongs to the application.
#[derive(Debug)]
struct AcceptAnyClientCert {
    supported_schemes: Vec<SignatureScheme>,
}

impl AcceptAnyClientCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            supported_schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Empty — the client should present whatever certificate it has.
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        // Signature verification is kept intact even though the chain is not
        // validated, so the handshake transcript stays authenticated.
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

// ---------------------------------------------------------------------------
// Client-side: permissive ServerCertVerifier
// ---------------------------------------------------------------------------

/// A server certificate verifier that accepts any certificate.
///
/// Selected by `accept_invalid_certificates` — the common deployment for
/// framelink peers using self-signed certificates.
#[derive(Debug)]
struct AcceptAnyServerCert {
    supported_schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            supported_schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

// ---------------------------------------------------------------------------
// Public builders
// ---------------------------------------------------------------------------

fn cert_and_key(settings: &TlsSettings) -> LinkResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert_der = settings
        .cert_der
        .clone()
        .ok_or_else(|| LinkError::Tls("certificate required but not configured".into()))?;
    let key_der = settings
        .key_der
        .clone()
        .ok_or_else(|| LinkError::Tls("private key required but not configured".into()))?;
    Ok((
        CertificateDer::from(cert_der),
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der)),
    ))
}

fn trust_anchors(settings: &TlsSettings) -> LinkResult<Arc<RootCertStore>> {
    let ca_der = settings.ca_der.clone().ok_or_else(|| {
        LinkError::Tls("certificate validation enabled but no trust anchor configured".into())
    })?;
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_der))
        .map_err(tls_err)?;
    Ok(Arc::new(roots))
}

/// Build a `rustls::ServerConfig` for the framelink listener.
pub fn build_server_config(settings: &TlsSettings) -> LinkResult<ServerConfig> {
    let provider = default_provider();
    let (cert, key) = cert_and_key(settings)?;

    let builder = ServerConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(tls_err)?;

    let mut config = if settings.mutually_authenticate {
        if settings.accept_invalid_certificates {
            builder
                .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new(&provider)))
                .with_single_cert(vec![cert], key)
                .map_err(tls_err)?
        } else {
            let verifier = WebPkiClientVerifier::builder_with_provider(
                trust_anchors(settings)?,
                Arc::new(provider.clone()),
            )
            .build()
            .map_err(tls_err)?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(vec![cert], key)
                .map_err(tls_err)?
        }
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(tls_err)?
    };

    config.alpn_protocols = vec![ALPN_FRAMELINK.to_vec()];
    Ok(config)
}

/// Build a `rustls::ClientConfig` for connecting to a framelink server.
pub fn build_client_config(settings: &TlsSettings) -> LinkResult<ClientConfig> {
    let provider = default_provider();

    let builder = ClientConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(tls_err)?;

    let builder = if settings.accept_invalid_certificates {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
    } else {
        builder.with_root_certificates(trust_anchors(settings)?)
    };

    let mut config = if settings.mutually_authenticate {
        let (cert, key) = cert_and_key(settings)?;
        builder
            .with_client_auth_cert(vec![cert], key)
            .map_err(tls_err)?
    } else {
        builder.with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_FRAMELINK.to_vec()];
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_self_signed_cert;

    fn settings_with_cert() -> TlsSettings {
        let (cert_der, key_der) = generate_self_signed_cert("localhost").unwrap();
        TlsSettings {
            cert_der: Some(cert_der),
            key_der: Some(key_der),
            ..TlsSettings::default()
        }
    }

    #[test]
    fn test_build_server_config_default_policy() {
        let config = build_server_config(&settings_with_cert()).expect("server config");
        assert_eq!(config.alpn_protocols, vec![ALPN_FRAMELINK.to_vec()]);
    }

    #[test]
    fn test_build_server_config_mutual_auth() {
        let mut settings = settings_with_cert();
        settings.mutually_authenticate = true;
        let config = build_server_config(&settings).expect("server config");
        assert_eq!(config.alpn_protocols, vec![ALPN_FRAMELINK.to_vec()]);
    }

    #[test]
    fn test_build_server_config_requires_cert() {
        let settings = TlsSettings::default();
        let err = build_server_config(&settings).unwrap_err();
        assert!(matches!(err, LinkError::Tls(_)));
    }

    #[test]
    fn test_build_client_config_accept_invalid() {
        let settings = TlsSettings::default();
        assert!(settings.accept_invalid_certificates);
        let config = build_client_config(&settings).expect("client config");
        assert_eq!(config.alpn_protocols, vec![ALPN_FRAMELINK.to_vec()]);
    }

    #[test]
    fn test_build_client_config_strict_needs_anchor() {
        let settings = TlsSettings {
            accept_invalid_certificates: false,
            ..TlsSettings::default()
        };
        let err = build_client_config(&settings).unwrap_err();
        assert!(matches!(err, LinkError::Tls(_)));
    }

    #[test]
    fn test_build_client_config_strict_with_anchor() {
        let (cert_der, _key) = generate_self_signed_cert("localhost").unwrap();
        let settings = TlsSettings {
            accept_invalid_certificates: false,
            ca_der: Some(cert_der),
            ..TlsSettings::default()
        };
        let config = build_client_config(&settings).expect("client config");
        assert_eq!(config.alpn_protocols, vec![ALPN_FRAMELINK.to_vec()]);
    }

    #[test]
    fn test_mutual_client_config_presents_cert() {
        let mut settings = settings_with_cert();
        settings.mutually_authenticate = true;
        let config = build_client_config(&settings).expect("client config");
        assert_eq!(config.alpn_protocols, vec![ALPN_FRAMELINK.to_vec()]);
    }

    #[test]
    fn test_accept_any_client_cert_is_mandatory() {
        let verifier = AcceptAnyClientCert::new(&default_provider());
        assert!(verifier.offer_client_auth());
        assert!(verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
    }

    #[test]
    fn test_accept_any_verifiers_return_ok() {
        let dummy_cert = CertificateDer::from(vec![0u8; 1]);

        let client_verifier = AcceptAnyClientCert::new(&default_provider());
        assert!(client_verifier
            .verify_client_cert(&dummy_cert, &[], UnixTime::now())
            .is_ok());

        let server_verifier = AcceptAnyServerCert::new(&default_provider());
        let server_name = ServerName::try_from("example.com").unwrap();
        assert!(server_verifier
            .verify_server_cert(&dummy_cert, &[], &server_name, &[], UnixTime::now())
            .is_ok());
    }
}
