//! The framelink server: listener, admission control, TLS handshake,
//! session registry, and background reapers.
//!
//! `LinkServer` binds a TCP listener and spawns one receive loop per
//! accepted session. Admission is controlled by a permitted-IP allow-list
//! and a semaphore sized to `max_connections` — while every permit is held
//! the accept loop parks, resuming as soon as any session closes. An idle
//! reaper sweeps sessions whose last inbound activity is older than the
//! configured timeout, and the sync correlator's reaper sweeps expired
//! response entries.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{LinkError, LinkResult};
use crate::handler::ServerHandler;
use crate::message::{FrameHeader, MessageStatus, Metadata, SyncResponse, PRESHARED_KEY_LEN};
use crate::receiver::{run_server_session, ServerSessionContext};
use crate::registry::SessionRegistry;
use crate::sender;
use crate::session::Session;
use crate::stats::{LinkStatistics, StatisticsSnapshot};
use crate::sync::{SyncCorrelator, MIN_SYNC_TIMEOUT_MS};
use crate::tls::build_server_config;
use crate::transport::TransportStream;

/// Interval between idle-client sweeps.
const IDLE_REAPER_INTERVAL_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// LinkServer
// ---------------------------------------------------------------------------

/// A message-framed TCP server handling many concurrent client sessions.
pub struct LinkServer {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    registry: Arc<SessionRegistry>,
    correlator: Arc<SyncCorrelator>,
    cancel: CancellationToken,
    running: AtomicBool,
    local_addr: std::sync::RwLock<Option<SocketAddr>>,
    preshared_key: Option<[u8; PRESHARED_KEY_LEN]>,
    tls_acceptor: Option<TlsAcceptor>,
    stats: Arc<LinkStatistics>,
}

impl LinkServer {
    /// Validate the configuration and build a server. No socket is opened
    /// until [`start`](Self::start).
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> LinkResult<Arc<Self>> {
        config.validate()?;
        let preshared_key = config.preshared_key_bytes()?;

        let tls_acceptor = match &config.tls {
            Some(settings) => {
                let tls_config = build_server_config(settings)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            None => None,
        };

        Ok(Arc::new(LinkServer {
            config,
            handler,
            registry: Arc::new(SessionRegistry::new()),
            correlator: Arc::new(SyncCorrelator::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            local_addr: std::sync::RwLock::new(None),
            preshared_key,
            tls_acceptor,
            stats: Arc::new(LinkStatistics::new()),
        }))
    }

    /// Bind the listener and spawn the accept loop and reapers.
    ///
    /// Returns once the listener is bound; [`local_addr`](Self::local_addr)
    /// reports the actual port when binding to port zero.
    pub async fn start(self: &Arc<Self>) -> LinkResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LinkError::Argument("server already started".into()));
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().unwrap() = Some(addr);

        info!(
            addr = %addr,
            tls = self.tls_acceptor.is_some(),
            auth = self.preshared_key.is_some(),
            "framelink server listening"
        );

        self.correlator.spawn_reaper(self.cancel.clone());
        self.spawn_idle_reaper();

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        Ok(())
    }

    /// The bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap()
    }

    /// Endpoint ids of every connected session.
    pub async fn connected_clients(&self) -> Vec<String> {
        self.registry.endpoints().await
    }

    pub async fn is_client_connected(&self, endpoint: &str) -> bool {
        self.registry.contains(endpoint).await
    }

    /// Transfer counters for this server across all sessions.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Send a message with empty metadata to one client.
    pub async fn send(&self, endpoint: &str, payload: &[u8]) -> LinkResult<()> {
        self.send_with_metadata(endpoint, Metadata::new(), payload)
            .await
    }

    /// Send a message carrying metadata to one client.
    pub async fn send_with_metadata(
        &self,
        endpoint: &str,
        metadata: Metadata,
        payload: &[u8],
    ) -> LinkResult<()> {
        let session = self.require_session(endpoint).await?;
        let header = FrameHeader::normal(metadata, payload.len() as u64);
        sender::send_buffered(&session, &header, payload, self.config.debug_messages).await?;
        self.stats.record_sent(payload.len() as u64);
        // Outbound traffic counts as activity for the idle reaper.
        self.registry.touch(endpoint).await;
        Ok(())
    }

    /// Send a message whose payload streams from `body`. Exactly `length`
    /// bytes are drawn from the source.
    pub async fn send_stream(
        &self,
        endpoint: &str,
        metadata: Metadata,
        length: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LinkResult<()> {
        let session = self.require_session(endpoint).await?;
        let header = FrameHeader::normal(metadata, length);
        sender::send_streaming(&session, &header, body, self.config.debug_messages).await?;
        self.stats.record_sent(length);
        self.registry.touch(endpoint).await;
        Ok(())
    }

    /// Open a synchronous exchange with one client and block until its
    /// response arrives or `timeout_ms` elapses.
    pub async fn send_and_wait(
        &self,
        endpoint: &str,
        timeout_ms: u64,
        metadata: Metadata,
        payload: &[u8],
    ) -> LinkResult<SyncResponse> {
        if timeout_ms < MIN_SYNC_TIMEOUT_MS {
            return Err(LinkError::Argument(format!(
                "sync timeout must be >= {MIN_SYNC_TIMEOUT_MS} ms, got {timeout_ms}"
            )));
        }
        let session = self.require_session(endpoint).await?;
        let response = sender::send_and_wait_on(
            &session,
            &self.correlator,
            timeout_ms,
            metadata,
            payload,
            self.config.debug_messages,
        )
        .await?;
        self.stats.record_sent(payload.len() as u64);
        self.registry.touch(endpoint).await;
        Ok(response)
    }

    /// Remove one client: sends `Removed`, marks the disconnect as a kick
    /// (unless the idle reaper already claimed it), and tears the session
    /// down.
    pub async fn disconnect_client(&self, endpoint: &str) -> LinkResult<()> {
        let session = self.require_session(endpoint).await?;
        info!(endpoint, "disconnecting client");

        self.registry.mark_kicked(endpoint, Utc::now()).await;
        let _ = sender::send_control(&session, MessageStatus::Removed, self.config.debug_messages)
            .await;
        session.cancel_token().cancel();
        Ok(())
    }

    /// Announce shutdown to every session and stop the listener, reapers,
    /// and receive loops.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("framelink server shutting down");

        for endpoint in self.registry.endpoints().await {
            if let Some(session) = self.registry.get(&endpoint).await {
                let _ = sender::send_control(
                    &session,
                    MessageStatus::Disconnecting,
                    self.config.debug_messages,
                )
                .await;
            }
        }

        self.registry.cancel_all().await;
        self.cancel.cancel();
    }

    // -- internals ----------------------------------------------------------

    async fn require_session(&self, endpoint: &str) -> LinkResult<Arc<Session>> {
        self.registry
            .get(endpoint)
            .await
            .ok_or_else(|| LinkError::NotConnected(format!("no session for {endpoint}")))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            // Admission cap: hold a permit before accepting, so the listener
            // pauses while the server is full and resumes on session close.
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let (tcp_stream, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept TCP connection");
                        continue;
                    }
                },
            };

            if !self.ip_permitted(&peer_addr) {
                warn!(peer = %peer_addr, "connection refused by allow-list");
                drop(tcp_stream);
                continue;
            }

            debug!(peer = %peer_addr, "accepted TCP connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(tcp_stream, peer_addr, permit).await;
            });
        }

        debug!("accept loop stopped");
    }

    fn ip_permitted(&self, peer: &SocketAddr) -> bool {
        if self.config.permitted_ips.is_empty() {
            return true;
        }
        let ip = peer.ip().to_string();
        self.config.permitted_ips.iter().any(|allowed| *allowed == ip)
    }

    async fn handle_connection(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let transport = match &self.tls_acceptor {
            Some(acceptor) => match acceptor.accept(tcp_stream).await {
                Ok(tls_stream) => TransportStream::TlsServer(Box::new(tls_stream)),
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => TransportStream::Plain(tcp_stream),
        };

        let endpoint = peer_addr.to_string();
        let session = Session::new(
            endpoint.clone(),
            transport,
            self.config.stream_buffer_size,
            self.cancel.child_token(),
        );

        let authenticated = self.preshared_key.is_none();
        self.registry
            .insert(Arc::clone(&session), authenticated)
            .await;

        info!(endpoint = endpoint.as_str(), "client connected");
        self.handler.client_connected(&endpoint).await;

        if !authenticated {
            let _ = sender::send_control(
                &session,
                MessageStatus::AuthRequired,
                self.config.debug_messages,
            )
            .await;
        }

        run_server_session(ServerSessionContext {
            session,
            registry: Arc::clone(&self.registry),
            correlator: Arc::clone(&self.correlator),
            handler: Arc::clone(&self.handler),
            preshared_key: self.preshared_key,
            max_proxied_stream_size: self.config.max_proxied_stream_size,
            debug_messages: self.config.debug_messages,
            stats: Arc::clone(&self.stats),
        })
        .await;

        // Releasing the permit un-parks the accept loop.
        drop(permit);
    }

    fn spawn_idle_reaper(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                IDLE_REAPER_INTERVAL_MS,
            ));
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    _ = interval.tick() => server.reap_idle_clients().await,
                }
            }
        });
    }

    async fn reap_idle_clients(&self) {
        let timeout_secs = self.config.idle_client_timeout_seconds;
        if timeout_secs == 0 {
            return;
        }

        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(timeout_secs as i64);
        for endpoint in self.registry.idle_endpoints(cutoff).await {
            warn!(endpoint = endpoint.as_str(), "evicting idle client");
            self.registry.mark_timed_out(&endpoint, now).await;
            if let Some(session) = self.registry.get(&endpoint).await {
                let _ = sender::send_control(
                    &session,
                    MessageStatus::Removed,
                    self.config.debug_messages,
                )
                .await;
                session.cancel_token().cancel();
            }
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
    impl ServerHandler for Quiet {}

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_reports_bound_addr() {
        let server = LinkServer::new(test_config(), Arc::new(Quiet)).unwrap();
        assert!(server.local_addr().is_none());

        server.start().await.unwrap();
        let addr = server.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = LinkServer::new(test_config(), Arc::new(Quiet)).unwrap();
        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, LinkError::Argument(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig {
            preshared_key: Some("short".into()),
            ..test_config()
        };
        assert!(LinkServer::new(config, Arc::new(Quiet)).is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_endpoint() {
        let server = LinkServer::new(test_config(), Arc::new(Quiet)).unwrap();
        server.start().await.unwrap();

        let err = server.send("10.1.1.1:5555", b"hello").await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));

        let err = server.disconnect_client("10.1.1.1:5555").await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_timeout_minimum_enforced() {
        let server = LinkServer::new(test_config(), Arc::new(Quiet)).unwrap();
        server.start().await.unwrap();

        // Argument validation fires before the endpoint lookup.
        let err = server
            .send_and_wait("10.1.1.1:5555", 999, Metadata::new(), b"ping")
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Argument(_)));

        server.shutdown().await;
    }

    #[test]
    fn test_ip_allow_list() {
        let config = ServerConfig {
            permitted_ips: vec!["10.0.0.5".into()],
            ..test_config()
        };
        let server = LinkServer::new(config, Arc::new(Quiet)).unwrap();

        let allowed: SocketAddr = "10.0.0.5:1234".parse().unwrap();
        let denied: SocketAddr = "10.0.0.6:1234".parse().unwrap();
        assert!(server.ip_permitted(&allowed));
        assert!(!server.ip_permitted(&denied));

        let open = LinkServer::new(test_config(), Arc::new(Quiet)).unwrap();
        assert!(open.ip_permitted(&denied));
    }
}
