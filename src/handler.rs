//! Application callback traits.
//!
//! Both endpoints deliver inbound traffic and lifecycle events through a
//! trait object with default no-op methods, so applications implement only
//! what they care about. Buffered messages are dispatched on a separate
//! per-session task (the receiver keeps reading); streamed messages and
//! sync requests are awaited inline, because the next frame cannot be
//! parsed until the payload is drained.
//!
//! Errors returned from these callbacks are caught at the receiver: they
//! are logged, reported through `error_encountered`, and never tear down
//! the session on their own.

use async_trait::async_trait;

use crate::error::{DisconnectReason, LinkError, LinkResult};
use crate::frame::BoundedBody;
use crate::message::{InboundMessage, Metadata, SyncRequest, SyncResponse};

// ---------------------------------------------------------------------------
// ServerHandler
// ---------------------------------------------------------------------------

/// Callbacks invoked by a [`LinkServer`](crate::server::LinkServer).
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// A session completed its transport handshake and was registered.
    async fn client_connected(&self, _endpoint: &str) {}

    /// A session ended. `reason` distinguishes peer-initiated disconnects
    /// from kicks and idle-timeout evictions.
    async fn client_disconnected(&self, _endpoint: &str, _reason: DisconnectReason) {}

    /// An unauthenticated session sent something other than credentials.
    /// The server re-sends `AuthRequired`; this hook is informational.
    async fn authentication_requested(&self, _endpoint: &str) {}

    /// A session presented the correct preshared key.
    async fn authentication_succeeded(&self, _endpoint: &str) {}

    /// A session presented a wrong or missing preshared key. The connection
    /// stays open and the client may retry.
    async fn authentication_failed(&self, _endpoint: &str) {}

    /// A fully buffered message arrived. Dispatched on a separate task;
    /// per-session delivery order matches wire order.
    async fn message_received(&self, _endpoint: &str, _message: InboundMessage) -> LinkResult<()> {
        Ok(())
    }

    /// A large message arrived; `body` reads its payload directly off the
    /// transport. Awaited inline — the session reads nothing further until
    /// this returns. Unread payload bytes are discarded afterwards.
    async fn stream_received(
        &self,
        _endpoint: &str,
        _metadata: &Metadata,
        _body: &mut BoundedBody<'_>,
    ) -> LinkResult<()> {
        Ok(())
    }

    /// A synchronous request arrived. Returning `Some` sends the response
    /// immediately on the same session; `None` leaves the caller to time out.
    async fn sync_request_received(
        &self,
        _endpoint: &str,
        _request: SyncRequest,
    ) -> LinkResult<Option<SyncResponse>> {
        Ok(None)
    }

    /// A callback returned an error, or a non-fatal fault was swallowed by
    /// the receiver.
    async fn error_encountered(&self, _endpoint: &str, _error: &LinkError) {}
}

// ---------------------------------------------------------------------------
// ClientHandler
// ---------------------------------------------------------------------------

/// Callbacks invoked by a [`LinkClient`](crate::client::LinkClient).
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// The connection to the server ended, for any reason.
    async fn server_disconnected(&self) {}

    /// The server demands authentication and no preshared key is configured.
    /// Return the key to present, or `None` to stay unauthenticated.
    async fn authentication_requested(&self) -> Option<String> {
        None
    }

    /// The server accepted the presented key.
    async fn authentication_succeeded(&self) {}

    /// The server rejected the presented key. Retry by sending again or
    /// reconnecting with corrected credentials.
    async fn authentication_failed(&self) {}

    /// A fully buffered message arrived. Dispatched on a separate task;
    /// delivery order matches wire order.
    async fn message_received(&self, _message: InboundMessage) -> LinkResult<()> {
        Ok(())
    }

    /// A large message arrived; `body` reads its payload directly off the
    /// transport. Awaited inline.
    async fn stream_received(
        &self,
        _metadata: &Metadata,
        _body: &mut BoundedBody<'_>,
    ) -> LinkResult<()> {
        Ok(())
    }

    /// The server opened a synchronous exchange with this client.
    async fn sync_request_received(
        &self,
        _request: SyncRequest,
    ) -> LinkResult<Option<SyncResponse>> {
        Ok(None)
    }

    /// A callback returned an error, or a non-fatal fault was swallowed by
    /// the receiver.
    async fn error_encountered(&self, _error: &LinkError) {}
}
