//! TOML-loadable configuration for framelink servers and clients.
//!
//! Every field has a compiled-in default, so a partial file (or none at all)
//! yields a working configuration. TLS material is DER bytes supplied
//! programmatically and is not part of the on-disk format.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LinkError, LinkResult};
use crate::message::PRESHARED_KEY_LEN;

/// Lower bound on the client connect timeout.
pub const MIN_CONNECT_TIMEOUT_SECS: u64 = 1;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`LinkServer`](crate::server::LinkServer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub bind_address: String,
    /// Chunk size for payload I/O.
    pub stream_buffer_size: usize,
    /// Payloads at or above this size are delivered as a stream instead of
    /// a buffered byte array.
    pub max_proxied_stream_size: u64,
    /// Sessions idle longer than this are evicted. Zero disables eviction.
    pub idle_client_timeout_seconds: u64,
    /// Maximum concurrent sessions; the listener pauses while at the cap.
    pub max_connections: usize,
    /// When set, every session starts unauthenticated and must present this
    /// key. Trimmed; must be exactly 16 bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Allow-list of client IPs. Empty admits any address.
    pub permitted_ips: Vec<String>,
    /// Emit frame-level traces.
    pub debug_messages: bool,
    /// TLS material; `None` runs plain TCP.
    #[serde(skip)]
    pub tls: Option<TlsSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            stream_buffer_size: 65536,
            max_proxied_stream_size: 67_108_864,
            idle_client_timeout_seconds: 0,
            max_connections: 4096,
            preshared_key: None,
            permitted_ips: Vec::new(),
            debug_messages: false,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> LinkResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LinkError::Argument(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        info!(path = %path.display(), "loaded server configuration");
        Ok(config)
    }

    /// Reject out-of-range values before any socket is opened.
    pub fn validate(&self) -> LinkResult<()> {
        if self.stream_buffer_size == 0 {
            return Err(LinkError::Argument("stream_buffer_size must be > 0".into()));
        }
        if self.max_proxied_stream_size == 0 {
            return Err(LinkError::Argument(
                "max_proxied_stream_size must be > 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(LinkError::Argument("max_connections must be >= 1".into()));
        }
        self.preshared_key_bytes()?;
        Ok(())
    }

    /// The configured preshared key as exact key material, if any.
    pub fn preshared_key_bytes(&self) -> LinkResult<Option<[u8; PRESHARED_KEY_LEN]>> {
        preshared_key_bytes(self.preshared_key.as_deref())
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`LinkClient`](crate::client::LinkClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address and port to connect to.
    pub server_address: String,
    /// Maximum time to wait for the TCP connection.
    pub connect_timeout_seconds: u64,
    /// Chunk size for payload I/O.
    pub stream_buffer_size: usize,
    /// Payloads at or above this size are delivered as a stream instead of
    /// a buffered byte array.
    pub max_proxied_stream_size: u64,
    /// Key presented when the server demands authentication. Trimmed; must
    /// be exactly 16 bytes when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Emit frame-level traces.
    pub debug_messages: bool,
    /// TLS material; `None` runs plain TCP.
    #[serde(skip)]
    pub tls: Option<TlsSettings>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:9000".to_string(),
            connect_timeout_seconds: 5,
            stream_buffer_size: 65536,
            max_proxied_stream_size: 67_108_864,
            preshared_key: None,
            debug_messages: false,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> LinkResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LinkError::Argument(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        info!(path = %path.display(), "loaded client configuration");
        Ok(config)
    }

    /// Reject out-of-range values before connecting.
    pub fn validate(&self) -> LinkResult<()> {
        if self.connect_timeout_seconds < MIN_CONNECT_TIMEOUT_SECS {
            return Err(LinkError::Argument(format!(
                "connect_timeout_seconds must be >= {MIN_CONNECT_TIMEOUT_SECS}"
            )));
        }
        if self.stream_buffer_size == 0 {
            return Err(LinkError::Argument("stream_buffer_size must be > 0".into()));
        }
        if self.max_proxied_stream_size == 0 {
            return Err(LinkError::Argument(
                "max_proxied_stream_size must be > 0".into(),
            ));
        }
        self.preshared_key_bytes()?;
        Ok(())
    }

    /// The configured preshared key as exact key material, if any.
    pub fn preshared_key_bytes(&self) -> LinkResult<Option<[u8; PRESHARED_KEY_LEN]>> {
        preshared_key_bytes(self.preshared_key.as_deref())
    }
}

// ---------------------------------------------------------------------------
// TlsSettings
// ---------------------------------------------------------------------------

/// TLS material and policy for one endpoint.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// DER-encoded certificate presented to the peer. Required on servers,
    /// and on clients when `mutually_authenticate` is set.
    pub cert_der: Option<Vec<u8>>,
    /// DER-encoded PKCS#8 private key matching `cert_der`.
    pub key_der: Option<Vec<u8>>,
    /// DER-encoded trust anchor for peer validation; consulted only when
    /// `accept_invalid_certificates` is false.
    pub ca_der: Option<Vec<u8>>,
    /// Server name sent in SNI by clients.
    pub server_name: String,
    /// Skip certificate chain validation.
    pub accept_invalid_certificates: bool,
    /// Require the peer to present a client certificate.
    pub mutually_authenticate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_der: None,
            key_der: None,
            ca_der: None,
            server_name: "localhost".to_string(),
            accept_invalid_certificates: true,
            mutually_authenticate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared key validation
// ---------------------------------------------------------------------------

fn preshared_key_bytes(key: Option<&str>) -> LinkResult<Option<[u8; PRESHARED_KEY_LEN]>> {
    match key {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            let bytes: [u8; PRESHARED_KEY_LEN] =
                trimmed.as_bytes().try_into().map_err(|_| {
                    LinkError::Argument(format!(
                        "preshared_key must be exactly {PRESHARED_KEY_LEN} bytes after trimming, got {}",
                        trimmed.len()
                    ))
                })?;
            Ok(Some(bytes))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_address, "0.0.0.0:9000");
        assert_eq!(cfg.stream_buffer_size, 65536);
        assert_eq!(cfg.max_proxied_stream_size, 67_108_864);
        assert_eq!(cfg.idle_client_timeout_seconds, 0);
        assert_eq!(cfg.max_connections, 4096);
        assert!(cfg.preshared_key.is_none());
        assert!(cfg.permitted_ips.is_empty());
        assert!(!cfg.debug_messages);
        assert!(cfg.tls.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_client_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server_address, "127.0.0.1:9000");
        assert_eq!(cfg.connect_timeout_seconds, 5);
        assert_eq!(cfg.stream_buffer_size, 65536);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
bind_address = "127.0.0.1:9005"
idle_client_timeout_seconds = 30
preshared_key = "0123456789ABCDEF"
permitted_ips = ["10.0.0.5", "10.0.0.6"]
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:9005");
        assert_eq!(cfg.idle_client_timeout_seconds, 30);
        assert_eq!(cfg.preshared_key.as_deref(), Some("0123456789ABCDEF"));
        assert_eq!(cfg.permitted_ips.len(), 2);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_connections, 4096);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("framelink.toml");
        std::fs::write(&path, "server_address = \"192.168.1.9:9000\"\n").unwrap();

        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.server_address, "192.168.1.9:9000");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = ServerConfig::load(Path::new("/nonexistent/framelink.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_preshared_key_trimmed_and_sized() {
        let cfg = ServerConfig {
            preshared_key: Some("  0123456789ABCDEF  ".into()),
            ..ServerConfig::default()
        };
        let key = cfg.preshared_key_bytes().unwrap().unwrap();
        assert_eq!(&key, b"0123456789ABCDEF");
    }

    #[test]
    fn test_preshared_key_wrong_length() {
        let cfg = ServerConfig {
            preshared_key: Some("tooshort".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(LinkError::Argument(_))
        ));
    }

    #[test]
    fn test_connect_timeout_minimum() {
        let cfg = ClientConfig {
            connect_timeout_seconds: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LinkError::Argument(_))));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cfg = ServerConfig {
            stream_buffer_size: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tls_settings_defaults() {
        let tls = TlsSettings::default();
        assert!(tls.accept_invalid_certificates);
        assert!(!tls.mutually_authenticate);
        assert_eq!(tls.server_name, "localhost");
        assert!(tls.cert_der.is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = ServerConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.bind_address, cfg.bind_address);
        assert_eq!(back.max_proxied_stream_size, cfg.max_proxied_stream_size);
    }
}
