//! Outbound frame transmission under the session's write lock.
//!
//! Every exit path releases the lock (guard drop), and any transport error
//! marks the session dead so the receiver loop tears it down. Safe to call
//! concurrently with the receiver: the two sides use separate locks.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncRead;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LinkError, LinkResult};
use crate::message::{FrameHeader, MessageStatus, Metadata, SyncResponse};
use crate::session::Session;
use crate::sync::{SyncCorrelator, MIN_SYNC_TIMEOUT_MS};

/// Write one frame with a fully buffered payload.
pub(crate) async fn send_buffered(
    session: &Session,
    header: &FrameHeader,
    payload: &[u8],
    debug_messages: bool,
) -> LinkResult<()> {
    if debug_messages {
        debug!(
            endpoint = session.endpoint(),
            header = %header_json(header),
            "sending frame"
        );
    }

    let mut writer = session.writer.lock().await;
    match writer.write_frame(header, payload).await {
        Ok(()) => Ok(()),
        Err(e) => {
            session.mark_dead();
            Err(e)
        }
    }
}

/// Write one frame whose payload streams from `body`.
pub(crate) async fn send_streaming(
    session: &Session,
    header: &FrameHeader,
    body: &mut (dyn AsyncRead + Unpin + Send),
    debug_messages: bool,
) -> LinkResult<()> {
    if debug_messages {
        debug!(
            endpoint = session.endpoint(),
            header = %header_json(header),
            "sending streamed frame"
        );
    }

    let mut writer = session.writer.lock().await;
    match writer.write_frame_streaming(header, body).await {
        Ok(()) => Ok(()),
        Err(e) => {
            session.mark_dead();
            Err(e)
        }
    }
}

/// Write a zero-payload control frame.
pub(crate) async fn send_control(
    session: &Session,
    status: MessageStatus,
    debug_messages: bool,
) -> LinkResult<()> {
    send_buffered(session, &FrameHeader::control(status), b"", debug_messages).await
}

fn header_json(header: &FrameHeader) -> String {
    serde_json::to_string(header).unwrap_or_else(|_| "<unserializable>".into())
}

// ---------------------------------------------------------------------------
// Synchronous exchange
// ---------------------------------------------------------------------------

/// Open a synchronous exchange on `session` and wait for the response.
///
/// Used by both endpoints: the GUID is freshly generated, the expiration is
/// `now + timeout_ms`, and the waiter is registered before the request frame
/// is written so a fast response cannot slip past it.
pub(crate) async fn send_and_wait_on(
    session: &Arc<Session>,
    correlator: &Arc<SyncCorrelator>,
    timeout_ms: u64,
    metadata: Metadata,
    payload: &[u8],
    debug_messages: bool,
) -> LinkResult<SyncResponse> {
    if timeout_ms < MIN_SYNC_TIMEOUT_MS {
        return Err(LinkError::Argument(format!(
            "sync timeout must be >= {MIN_SYNC_TIMEOUT_MS} ms, got {timeout_ms}"
        )));
    }

    let guid = Uuid::new_v4().to_string();
    let expiration = Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64);
    let notify = correlator.register_request(&guid).await;

    let header =
        FrameHeader::sync_request(guid.clone(), expiration, metadata, payload.len() as u64);

    if let Err(e) = send_buffered(session, &header, payload, debug_messages).await {
        correlator.unregister(&guid).await;
        return Err(e);
    }

    let result = correlator.await_response(&guid, expiration, &notify).await;
    correlator.unregister(&guid).await;

    match result {
        Ok(pending) => Ok(SyncResponse {
            metadata: pending.metadata,
            payload: pending.payload,
        }),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
