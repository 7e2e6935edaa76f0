//! The per-session receive loop.
//!
//! One loop runs per session, on both endpoints. Each iteration checks the
//! cancel signal and probes the peer, takes the read lock, drives the
//! framer for one frame, and dispatches on the frame's status: control
//! statuses steer the state machine, `Normal` frames route to the sync
//! correlator or the application.
//! Transport and framing errors never retry — they convert directly into
//! session teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::frame::FrameReader;
use crate::handler::{ClientHandler, ServerHandler};
use crate::message::{
    FrameHeader, InboundMessage, MessageStatus, SyncRequest, SyncResponse, PRESHARED_KEY_LEN,
};
use crate::registry::SessionRegistry;
use crate::sender;
use crate::session::Session;
use crate::stats::LinkStatistics;
use crate::sync::{effective_expiration, PendingResponse, SyncCorrelator};
use crate::transport::TransportReadHalf;

type Reader<'a> = MutexGuard<'a, FrameReader<TransportReadHalf>>;

// ---------------------------------------------------------------------------
// HandlerRef: one dispatch surface over both handler traits
// ---------------------------------------------------------------------------

/// The routing of `Normal` frames is identical on both endpoints; only the
/// callback signatures differ. This adapter folds the two traits into one
/// call surface so the routing logic exists once.
enum HandlerRef<'a> {
    Server {
        handler: &'a dyn ServerHandler,
        endpoint: &'a str,
    },
    Client {
        handler: &'a dyn ClientHandler,
    },
}

impl HandlerRef<'_> {
    async fn stream_received(
        &self,
        metadata: &crate::message::Metadata,
        body: &mut crate::frame::BoundedBody<'_>,
    ) -> LinkResult<()> {
        match self {
            HandlerRef::Server { handler, endpoint } => {
                handler.stream_received(endpoint, metadata, body).await
            }
            HandlerRef::Client { handler } => handler.stream_received(metadata, body).await,
        }
    }

    async fn sync_request_received(
        &self,
        request: SyncRequest,
    ) -> LinkResult<Option<SyncResponse>> {
        match self {
            HandlerRef::Server { handler, endpoint } => {
                handler.sync_request_received(endpoint, request).await
            }
            HandlerRef::Client { handler } => handler.sync_request_received(request).await,
        }
    }

    async fn error_encountered(&self, error: &LinkError) {
        match self {
            HandlerRef::Server { handler, endpoint } => {
                handler.error_encountered(endpoint, error).await
            }
            HandlerRef::Client { handler } => handler.error_encountered(error).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Server-side loop
// ---------------------------------------------------------------------------

/// Everything the server-side receive loop needs for one session.
pub(crate) struct ServerSessionContext {
    pub session: Arc<Session>,
    pub registry: Arc<SessionRegistry>,
    pub correlator: Arc<SyncCorrelator>,
    pub handler: Arc<dyn ServerHandler>,
    pub preshared_key: Option<[u8; PRESHARED_KEY_LEN]>,
    pub max_proxied_stream_size: u64,
    pub debug_messages: bool,
    pub stats: Arc<LinkStatistics>,
}

/// Drive one server-side session until it disconnects, then clean up.
///
/// Cleanup removes the session from the registry, resolves the disconnect
/// reason from the kick/timeout marks, and fires `client_disconnected`.
pub(crate) async fn run_server_session(ctx: ServerSessionContext) {
    let endpoint = ctx.session.endpoint().to_string();
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<InboundMessage>();

    // Buffered messages dispatch on this task so the receiver keeps reading
    // while preserving per-session FIFO delivery.
    let dispatcher = {
        let handler = Arc::clone(&ctx.handler);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(message) = delivery_rx.recv().await {
                if let Err(e) = handler.message_received(&endpoint, message).await {
                    warn!(endpoint = endpoint.as_str(), error = %e, "message handler failed");
                    handler.error_encountered(&endpoint, &e).await;
                }
            }
        })
    };

    loop {
        if !ctx.session.is_alive() || !ctx.session.is_peer_alive() {
            break;
        }
        let cancel = ctx.session.cancel_token().clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = server_read_one(&ctx, &endpoint, &delivery_tx) => outcome,
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!(endpoint = endpoint.as_str(), error = %e, "session read failed");
                ctx.session.mark_dead();
                break;
            }
        }
    }

    // Let queued buffered messages drain before announcing the disconnect.
    drop(delivery_tx);
    let _ = dispatcher.await;

    ctx.session.shutdown_write().await;
    if let Some((_, reason)) = ctx.registry.remove(&endpoint).await {
        info!(endpoint = endpoint.as_str(), %reason, "client disconnected");
        ctx.handler.client_disconnected(&endpoint, reason).await;
    }
}

/// Read and dispatch a single frame. `Ok(false)` ends the session.
async fn server_read_one(
    ctx: &ServerSessionContext,
    endpoint: &str,
    delivery_tx: &mpsc::UnboundedSender<InboundMessage>,
) -> LinkResult<bool> {
    let mut reader = ctx.session.reader.lock().await;

    let header = match reader.read_header().await? {
        Some(header) => header,
        None => {
            debug!(endpoint, "peer closed the connection");
            return Ok(false);
        }
    };
    if ctx.debug_messages {
        debug!(endpoint, status = %header.status, content_length = header.content_length, "frame received");
    }

    match header.status {
        MessageStatus::Removed | MessageStatus::Disconnecting => {
            let _ = reader.discard(header.content_length).await;
            debug!(endpoint, status = %header.status, "peer is leaving");
            Ok(false)
        }

        MessageStatus::AuthRequested => {
            reader.discard(header.content_length).await?;
            drop(reader);
            server_handle_auth(ctx, endpoint, header.preshared_key).await;
            Ok(true)
        }

        // Server-originated statuses echoed back by a confused peer.
        MessageStatus::AuthRequired
        | MessageStatus::AuthSuccess
        | MessageStatus::AuthFailure => {
            warn!(endpoint, status = %header.status, "unexpected status from client");
            reader.discard(header.content_length).await?;
            Ok(true)
        }

        MessageStatus::Normal => {
            if !ctx.registry.is_authenticated(endpoint).await {
                // Auth gate: swallow the frame, nudge the client again.
                reader.discard(header.content_length).await?;
                drop(reader);
                debug!(endpoint, "data from unauthenticated client rejected");
                ctx.handler.authentication_requested(endpoint).await;
                let _ = sender::send_control(
                    &ctx.session,
                    MessageStatus::AuthRequired,
                    ctx.debug_messages,
                )
                .await;
                return Ok(true);
            }

            let handler_ref = HandlerRef::Server {
                handler: ctx.handler.as_ref(),
                endpoint,
            };
            route_normal(
                &mut reader,
                header,
                &ctx.session,
                &ctx.correlator,
                &handler_ref,
                ctx.max_proxied_stream_size,
                ctx.debug_messages,
                delivery_tx,
                &ctx.stats,
            )
            .await?;
            drop(reader);
            ctx.registry.touch(endpoint).await;
            Ok(true)
        }
    }
}

/// Validate presented key material against the configured preshared key.
async fn server_handle_auth(
    ctx: &ServerSessionContext,
    endpoint: &str,
    presented: Option<[u8; PRESHARED_KEY_LEN]>,
) {
    let Some(expected) = ctx.preshared_key else {
        warn!(endpoint, "auth request but no preshared key configured");
        return;
    };

    match presented {
        Some(key) if key == expected => {
            info!(endpoint, "authentication succeeded");
            ctx.registry.set_authenticated(endpoint).await;
            let _ = sender::send_control(
                &ctx.session,
                MessageStatus::AuthSuccess,
                ctx.debug_messages,
            )
            .await;
            ctx.handler.authentication_succeeded(endpoint).await;
        }
        _ => {
            warn!(endpoint, "authentication declined");
            let _ = sender::send_control(
                &ctx.session,
                MessageStatus::AuthFailure,
                ctx.debug_messages,
            )
            .await;
            ctx.handler.authentication_failed(endpoint).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Client-side loop
// ---------------------------------------------------------------------------

/// Everything the client-side receive loop needs.
pub(crate) struct ClientSessionContext {
    pub session: Arc<Session>,
    pub correlator: Arc<SyncCorrelator>,
    pub handler: Arc<dyn ClientHandler>,
    pub preshared_key: Option<[u8; PRESHARED_KEY_LEN]>,
    pub max_proxied_stream_size: u64,
    pub debug_messages: bool,
    pub connected: Arc<AtomicBool>,
    pub stats: Arc<LinkStatistics>,
}

/// Drive the client's single session until the server goes away.
pub(crate) async fn run_client_session(ctx: ClientSessionContext) {
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<InboundMessage>();

    let dispatcher = {
        let handler = Arc::clone(&ctx.handler);
        tokio::spawn(async move {
            while let Some(message) = delivery_rx.recv().await {
                if let Err(e) = handler.message_received(message).await {
                    warn!(error = %e, "message handler failed");
                    handler.error_encountered(&e).await;
                }
            }
        })
    };

    loop {
        if !ctx.session.is_alive() || !ctx.session.is_peer_alive() {
            break;
        }
        let cancel = ctx.session.cancel_token().clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = client_read_one(&ctx, &delivery_tx) => outcome,
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!(error = %e, "session read failed");
                ctx.session.mark_dead();
                break;
            }
        }
    }

    drop(delivery_tx);
    let _ = dispatcher.await;

    ctx.session.shutdown_write().await;
    if ctx.connected.swap(false, Ordering::SeqCst) {
        info!("server disconnected");
        ctx.handler.server_disconnected().await;
    }
}

async fn client_read_one(
    ctx: &ClientSessionContext,
    delivery_tx: &mpsc::UnboundedSender<InboundMessage>,
) -> LinkResult<bool> {
    let mut reader = ctx.session.reader.lock().await;

    let header = match reader.read_header().await? {
        Some(header) => header,
        None => {
            debug!("server closed the connection");
            return Ok(false);
        }
    };
    if ctx.debug_messages {
        debug!(status = %header.status, content_length = header.content_length, "frame received");
    }

    match header.status {
        MessageStatus::Removed | MessageStatus::Disconnecting => {
            let _ = reader.discard(header.content_length).await;
            debug!(status = %header.status, "server is closing the session");
            Ok(false)
        }

        MessageStatus::AuthRequired => {
            reader.discard(header.content_length).await?;
            drop(reader);
            client_answer_auth(ctx).await;
            Ok(true)
        }

        MessageStatus::AuthSuccess => {
            reader.discard(header.content_length).await?;
            info!("authentication accepted by server");
            ctx.handler.authentication_succeeded().await;
            Ok(true)
        }

        MessageStatus::AuthFailure => {
            reader.discard(header.content_length).await?;
            warn!("authentication rejected by server");
            ctx.handler.authentication_failed().await;
            Ok(true)
        }

        MessageStatus::AuthRequested => {
            warn!("unexpected AuthRequested from server");
            reader.discard(header.content_length).await?;
            Ok(true)
        }

        MessageStatus::Normal => {
            let handler_ref = HandlerRef::Client {
                handler: ctx.handler.as_ref(),
            };
            route_normal(
                &mut reader,
                header,
                &ctx.session,
                &ctx.correlator,
                &handler_ref,
                ctx.max_proxied_stream_size,
                ctx.debug_messages,
                delivery_tx,
                &ctx.stats,
            )
            .await?;
            Ok(true)
        }
    }
}

/// Answer the server's authentication demand with configured or
/// handler-provided key material.
async fn client_answer_auth(ctx: &ClientSessionContext) {
    let key = match ctx.preshared_key {
        Some(key) => Some(key),
        None => match ctx.handler.authentication_requested().await {
            Some(raw) => match <[u8; PRESHARED_KEY_LEN]>::try_from(raw.trim().as_bytes()) {
                Ok(key) => Some(key),
                Err(_) => {
                    let err = LinkError::Authentication(format!(
                        "provided key is not {PRESHARED_KEY_LEN} bytes"
                    ));
                    warn!(error = %err, "cannot answer auth request");
                    ctx.handler.error_encountered(&err).await;
                    None
                }
            },
            None => None,
        },
    };

    match key {
        Some(key) => {
            debug!("presenting preshared key");
            let header = FrameHeader::auth_requested(key);
            let _ = sender::send_buffered(&ctx.session, &header, b"", ctx.debug_messages).await;
        }
        None => {
            let err =
                LinkError::Authentication("server requires a preshared key and none is available".into());
            warn!(error = %err, "authentication stalled");
            ctx.handler.error_encountered(&err).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared routing of Normal frames
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn route_normal(
    reader: &mut Reader<'_>,
    header: FrameHeader,
    session: &Arc<Session>,
    correlator: &SyncCorrelator,
    handler: &HandlerRef<'_>,
    max_proxied_stream_size: u64,
    debug_messages: bool,
    delivery_tx: &mpsc::UnboundedSender<InboundMessage>,
    stats: &LinkStatistics,
) -> LinkResult<()> {
    if header.sync_request {
        // Both validated present by FrameHeader::validate.
        let guid = header.conversation_guid.clone().unwrap_or_default();
        let stated = header.expiration.unwrap_or_else(Utc::now);

        let payload = reader.read_payload(header.content_length).await?;
        stats.record_received(payload.len() as u64);

        let now = Utc::now();
        let effective = effective_expiration(stated, header.sender_timestamp, now);
        if effective <= now {
            debug!(conversation = %guid, "dropping expired sync request");
            return Ok(());
        }

        let request = SyncRequest {
            conversation_guid: guid.clone(),
            expiration: effective,
            metadata: header.metadata,
            payload,
        };

        match handler.sync_request_received(request).await {
            Ok(Some(response)) => {
                // The response echoes the stated expiration, unadjusted.
                let response_header = FrameHeader::sync_response(
                    guid,
                    stated,
                    response.metadata.clone(),
                    response.payload.len() as u64,
                );
                let response_len = response.payload.len() as u64;
                sender::send_buffered(session, &response_header, &response.payload, debug_messages)
                    .await?;
                stats.record_sent(response_len);
            }
            Ok(None) => {
                debug!(conversation = %guid, "sync handler declined to respond");
            }
            Err(e) => {
                warn!(conversation = %guid, error = %e, "sync handler failed");
                handler.error_encountered(&e).await;
            }
        }
        return Ok(());
    }

    if header.sync_response {
        let guid = header.conversation_guid.clone().unwrap_or_default();
        let stated = header.expiration.unwrap_or_else(Utc::now);

        let payload = reader.read_payload(header.content_length).await?;
        stats.record_received(payload.len() as u64);
        correlator
            .deliver_response(
                guid,
                PendingResponse {
                    expiration: stated,
                    metadata: header.metadata,
                    payload,
                },
            )
            .await;
        return Ok(());
    }

    if header.content_length >= max_proxied_stream_size {
        // Large payload: hand the application a bounded view and block this
        // session's reads until it finishes.
        let length = header.content_length;
        let metadata = header.metadata;
        let mut body = reader.body(length);
        if let Err(e) = handler.stream_received(&metadata, &mut body).await {
            warn!(error = %e, "stream handler failed");
            handler.error_encountered(&e).await;
        }
        let leftover = body.remaining();
        drop(body);
        if leftover > 0 {
            reader.discard(leftover).await?;
        }
        stats.record_received(length);
        return Ok(());
    }

    // Small payload: buffer fully, dispatch on the delivery task.
    let payload = reader.read_payload(header.content_length).await?;
    stats.record_received(payload.len() as u64);
    let _ = delivery_tx.send(InboundMessage {
        metadata: header.metadata,
        payload,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
