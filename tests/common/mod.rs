//! Shared fixtures for the integration suites: probe handlers that forward
//! every callback into a channel the test can drain with a deadline.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use framelink::{
    BoundedBody, ClientHandler, DisconnectReason, InboundMessage, LinkResult, LinkServer,
    Metadata, ServerConfig, ServerHandler, SyncRequest, SyncResponse,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Server probe
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ServerEvent {
    Connected(String),
    Disconnected(String, DisconnectReason),
    Message(String, InboundMessage),
    Stream {
        endpoint: String,
        length: u64,
        prefix: Vec<u8>,
    },
    AuthRequested(String),
    AuthSucceeded(String),
    AuthFailed(String),
    Error(String),
}

pub struct ProbeServerHandler {
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// Payload to answer sync requests with; `None` leaves callers to time out.
    pub sync_reply: Option<Vec<u8>>,
    /// Artificial delay before the sync handler answers.
    pub sync_delay: Duration,
}

pub fn server_probe() -> (Arc<ProbeServerHandler>, mpsc::UnboundedReceiver<ServerEvent>) {
    server_probe_with_sync(Some(b"pong".to_vec()), Duration::ZERO)
}

pub fn server_probe_with_sync(
    sync_reply: Option<Vec<u8>>,
    sync_delay: Duration,
) -> (Arc<ProbeServerHandler>, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ProbeServerHandler {
            tx,
            sync_reply,
            sync_delay,
        }),
        rx,
    )
}

#[async_trait]
impl ServerHandler for ProbeServerHandler {
    async fn client_connected(&self, endpoint: &str) {
        let _ = self.tx.send(ServerEvent::Connected(endpoint.to_string()));
    }

    async fn client_disconnected(&self, endpoint: &str, reason: DisconnectReason) {
        let _ = self
            .tx
            .send(ServerEvent::Disconnected(endpoint.to_string(), reason));
    }

    async fn authentication_requested(&self, endpoint: &str) {
        let _ = self
            .tx
            .send(ServerEvent::AuthRequested(endpoint.to_string()));
    }

    async fn authentication_succeeded(&self, endpoint: &str) {
        let _ = self
            .tx
            .send(ServerEvent::AuthSucceeded(endpoint.to_string()));
    }

    async fn authentication_failed(&self, endpoint: &str) {
        let _ = self.tx.send(ServerEvent::AuthFailed(endpoint.to_string()));
    }

    async fn message_received(&self, endpoint: &str, message: InboundMessage) -> LinkResult<()> {
        let _ = self
            .tx
            .send(ServerEvent::Message(endpoint.to_string(), message));
        Ok(())
    }

    async fn stream_received(
        &self,
        endpoint: &str,
        _metadata: &Metadata,
        body: &mut BoundedBody<'_>,
    ) -> LinkResult<()> {
        let length = body.remaining();
        let mut prefix = vec![0u8; std::cmp::min(16, length) as usize];
        body.read_exact(&mut prefix).await?;
        // Drain the rest so the byte count is verified end to end.
        let mut rest = Vec::new();
        body.read_to_end(&mut rest).await?;
        assert_eq!(prefix.len() as u64 + rest.len() as u64, length);

        let _ = self.tx.send(ServerEvent::Stream {
            endpoint: endpoint.to_string(),
            length,
            prefix,
        });
        Ok(())
    }

    async fn sync_request_received(
        &self,
        _endpoint: &str,
        _request: SyncRequest,
    ) -> LinkResult<Option<SyncResponse>> {
        if self.sync_delay > Duration::ZERO {
            tokio::time::sleep(self.sync_delay).await;
        }
        Ok(self
            .sync_reply
            .as_ref()
            .map(|payload| SyncResponse::new(payload.clone())))
    }

    async fn error_encountered(&self, _endpoint: &str, error: &framelink::LinkError) {
        let _ = self.tx.send(ServerEvent::Error(error.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Client probe
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ClientEvent {
    ServerDisconnected,
    Message(InboundMessage),
    AuthSucceeded,
    AuthFailed,
    Error(String),
}

pub struct ProbeClientHandler {
    tx: mpsc::UnboundedSender<ClientEvent>,
    /// Key returned from `authentication_requested`, when the config has none.
    pub provided_key: Option<String>,
    /// Payload to answer server-initiated sync requests with.
    pub sync_reply: Option<Vec<u8>>,
}

pub fn client_probe() -> (Arc<ProbeClientHandler>, mpsc::UnboundedReceiver<ClientEvent>) {
    client_probe_with(None, Some(b"client-pong".to_vec()))
}

pub fn client_probe_with(
    provided_key: Option<String>,
    sync_reply: Option<Vec<u8>>,
) -> (Arc<ProbeClientHandler>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ProbeClientHandler {
            tx,
            provided_key,
            sync_reply,
        }),
        rx,
    )
}

#[async_trait]
impl ClientHandler for ProbeClientHandler {
    async fn server_disconnected(&self) {
        let _ = self.tx.send(ClientEvent::ServerDisconnected);
    }

    async fn authentication_requested(&self) -> Option<String> {
        self.provided_key.clone()
    }

    async fn authentication_succeeded(&self) {
        let _ = self.tx.send(ClientEvent::AuthSucceeded);
    }

    async fn authentication_failed(&self) {
        let _ = self.tx.send(ClientEvent::AuthFailed);
    }

    async fn message_received(&self, message: InboundMessage) -> LinkResult<()> {
        let _ = self.tx.send(ClientEvent::Message(message));
        Ok(())
    }

    async fn sync_request_received(
        &self,
        _request: SyncRequest,
    ) -> LinkResult<Option<SyncResponse>> {
        Ok(self
            .sync_reply
            .as_ref()
            .map(|payload| SyncResponse::new(payload.clone())))
    }

    async fn error_encountered(&self, error: &framelink::LinkError) {
        let _ = self.tx.send(ClientEvent::Error(error.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Start a server on an ephemeral loopback port and return its address.
pub async fn start_server(
    mut config: ServerConfig,
    handler: Arc<ProbeServerHandler>,
) -> (Arc<LinkServer>, String) {
    config.bind_address = "127.0.0.1:0".to_string();
    let server = LinkServer::new(config, handler).expect("server config");
    server.start().await.expect("server start");
    let addr = server.local_addr().expect("bound addr").to_string();
    (server, addr)
}

/// Receive the next event within `deadline`, panicking on silence.
pub async fn next_event<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    deadline: Duration,
) -> T {
    tokio::time::timeout(deadline, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Try to receive an event, returning `None` on deadline.
pub async fn try_next_event<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    deadline: Duration,
) -> Option<T> {
    tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
}
