//! The framelink client: a single long-lived session to one server.
//!
//! `LinkClient::connect` performs the TCP connection under the configured
//! timeout, the TLS handshake when configured, then spawns the receive loop
//! and the sync-correlator reaper. Reconnection after a disconnect is a
//! caller concern: construct a fresh client.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{LinkError, LinkResult};
use crate::handler::ClientHandler;
use crate::message::{FrameHeader, MessageStatus, Metadata, SyncResponse};
use crate::receiver::{run_client_session, ClientSessionContext};
use crate::sender;
use crate::session::Session;
use crate::stats::{LinkStatistics, StatisticsSnapshot};
use crate::sync::SyncCorrelator;
use crate::tls::build_client_config;
use crate::transport::TransportStream;

// ---------------------------------------------------------------------------
// LinkClient
// ---------------------------------------------------------------------------

/// A message-framed TCP client holding one session to a server.
pub struct LinkClient {
    config: ClientConfig,
    session: Arc<Session>,
    correlator: Arc<SyncCorrelator>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    stats: Arc<LinkStatistics>,
}

impl std::fmt::Debug for LinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkClient")
            .field("config", &self.config)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LinkClient {
    /// Connect, complete the TLS handshake when configured, and start the
    /// receive loop.
    pub async fn connect(
        config: ClientConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> LinkResult<Self> {
        config.validate()?;
        let preshared_key = config.preshared_key_bytes()?;

        let connect_timeout = std::time::Duration::from_secs(config.connect_timeout_seconds);
        debug!(server = config.server_address.as_str(), "connecting");
        let tcp_stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect(&config.server_address),
        )
        .await
        .map_err(|_| {
            LinkError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connect to {} timed out after {}s",
                    config.server_address, config.connect_timeout_seconds
                ),
            ))
        })??;

        let transport = match &config.tls {
            Some(settings) => {
                let tls_config = build_client_config(settings)?;
                let connector = TlsConnector::from(Arc::new(tls_config));
                let server_name = rustls_pki_types::ServerName::try_from(
                    settings.server_name.clone(),
                )
                .map_err(|e| LinkError::Tls(format!("bad server name: {e}")))?;
                let tls_stream = connector.connect(server_name, tcp_stream).await?;
                TransportStream::TlsClient(Box::new(tls_stream))
            }
            None => TransportStream::Plain(tcp_stream),
        };

        let endpoint = transport.peer_addr()?.to_string();
        let cancel = CancellationToken::new();
        let session = Session::new(
            endpoint.clone(),
            transport,
            config.stream_buffer_size,
            cancel.child_token(),
        );
        let correlator = Arc::new(SyncCorrelator::new());
        correlator.spawn_reaper(cancel.clone());

        let connected = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(LinkStatistics::new());
        tokio::spawn(run_client_session(ClientSessionContext {
            session: Arc::clone(&session),
            correlator: Arc::clone(&correlator),
            handler,
            preshared_key,
            max_proxied_stream_size: config.max_proxied_stream_size,
            debug_messages: config.debug_messages,
            connected: Arc::clone(&connected),
            stats: Arc::clone(&stats),
        }));

        info!(server = endpoint.as_str(), "connected");
        Ok(LinkClient {
            config,
            session,
            correlator,
            cancel,
            connected,
            stats,
        })
    }

    /// Whether the session is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.session.is_alive()
    }

    /// The server's `IP:port`.
    pub fn server_endpoint(&self) -> &str {
        self.session.endpoint()
    }

    /// Transfer counters for this client.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Send a message with empty metadata.
    pub async fn send(&self, payload: &[u8]) -> LinkResult<()> {
        self.send_with_metadata(Metadata::new(), payload).await
    }

    /// Send a message carrying metadata.
    pub async fn send_with_metadata(&self, metadata: Metadata, payload: &[u8]) -> LinkResult<()> {
        self.require_connected()?;
        let header = FrameHeader::normal(metadata, payload.len() as u64);
        sender::send_buffered(
            &self.session,
            &header,
            payload,
            self.config.debug_messages,
        )
        .await?;
        self.stats.record_sent(payload.len() as u64);
        Ok(())
    }

    /// Send a message whose payload streams from `body`. Exactly `length`
    /// bytes are drawn from the source.
    pub async fn send_stream(
        &self,
        metadata: Metadata,
        length: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LinkResult<()> {
        self.require_connected()?;
        let header = FrameHeader::normal(metadata, length);
        sender::send_streaming(&self.session, &header, body, self.config.debug_messages).await?;
        self.stats.record_sent(length);
        Ok(())
    }

    /// Open a synchronous exchange and block until the server's response
    /// arrives or `timeout_ms` elapses.
    pub async fn send_and_wait(&self, timeout_ms: u64, payload: &[u8]) -> LinkResult<SyncResponse> {
        self.send_and_wait_with_metadata(timeout_ms, Metadata::new(), payload)
            .await
    }

    /// Synchronous exchange carrying metadata.
    pub async fn send_and_wait_with_metadata(
        &self,
        timeout_ms: u64,
        metadata: Metadata,
        payload: &[u8],
    ) -> LinkResult<SyncResponse> {
        self.require_connected()?;
        let response = sender::send_and_wait_on(
            &self.session,
            &self.correlator,
            timeout_ms,
            metadata,
            payload,
            self.config.debug_messages,
        )
        .await?;
        self.stats.record_sent(payload.len() as u64);
        Ok(response)
    }

    /// Present a preshared key to the server explicitly.
    ///
    /// The receive loop answers `AuthRequired` on its own when a key is
    /// configured or provided by the handler; this method exists for
    /// retrying after an `AuthFailure` with corrected key material.
    pub async fn authenticate(&self, key: &str) -> LinkResult<()> {
        self.require_connected()?;
        let trimmed = key.trim();
        let key: [u8; crate::message::PRESHARED_KEY_LEN] =
            trimmed.as_bytes().try_into().map_err(|_| {
                LinkError::Argument(format!(
                    "preshared key must be exactly {} bytes after trimming, got {}",
                    crate::message::PRESHARED_KEY_LEN,
                    trimmed.len()
                ))
            })?;
        sender::send_buffered(
            &self.session,
            &FrameHeader::auth_requested(key),
            b"",
            self.config.debug_messages,
        )
        .await
    }

    /// Gracefully disconnect: announce `Disconnecting` so the server
    /// attributes the close as normal, then stop the receive loop.
    pub async fn disconnect(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        info!("disconnecting from server");
        let _ = sender::send_control(
            &self.session,
            MessageStatus::Disconnecting,
            self.config.debug_messages,
        )
        .await;
        self.cancel.cancel();
    }

    fn require_connected(&self) -> LinkResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected("client session is closed".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;
    impl ClientHandler for Quiet {}

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback should refuse immediately.
        let config = ClientConfig {
            server_address: "127.0.0.1:1".to_string(),
            ..ClientConfig::default()
        };
        let err = LinkClient::connect(config, Arc::new(Quiet)).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig {
            connect_timeout_seconds: 0,
            ..ClientConfig::default()
        };
        let err = LinkClient::connect(config, Arc::new(Quiet)).await.unwrap_err();
        assert!(matches!(err, LinkError::Argument(_)));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Hold the accepted socket open long enough for the test.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        });

        let config = ClientConfig {
            server_address: addr.to_string(),
            ..ClientConfig::default()
        };
        let client = LinkClient::connect(config, Arc::new(Quiet)).await.unwrap();
        assert!(client.is_connected());

        client.disconnect().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!client.is_connected());

        let err = client.send(b"late").await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
    }
}
