//! Error types surfaced by the framelink transport.
//!
//! Transport and framing failures are always fatal to the session that
//! produced them; authentication failures are not. The receiver converts
//! every non-recoverable error into session teardown, so callers only see
//! these through returned `Result`s and the handler's error hook.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type LinkResult<T> = Result<T, LinkError>;

// ---------------------------------------------------------------------------
// FramingError
// ---------------------------------------------------------------------------

/// A violation of the wire framing rules. Always fatal to the session.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The header bytes were not valid JSON, or a required field was missing
    /// or malformed.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// End of stream before `ContentLength` payload bytes arrived.
    #[error("truncated payload: expected {expected} bytes, read {read}")]
    TruncatedPayload { expected: u64, read: u64 },

    /// The header delimiter was not found within the maximum header size.
    #[error("frame header exceeded {max} bytes before the delimiter")]
    OversizedHeader { max: usize },
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

/// Failure of a synchronous request/response exchange.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No response with the matching conversation GUID arrived before the
    /// expiration deadline.
    #[error("synchronous request expired before a response arrived")]
    Timeout,
}

// ---------------------------------------------------------------------------
// LinkError
// ---------------------------------------------------------------------------

/// Top-level error type for all framelink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Any I/O failure on the underlying transport, including peer
    /// disconnect and TLS handshake failures.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A wire framing violation.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Wrong or missing preshared key. Non-fatal to the session.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A synchronous exchange failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Programmer error: an argument outside its documented range.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// TLS configuration or certificate setup failed.
    #[error("tls setup failed: {0}")]
    Tls(String),

    /// The operation requires a live session and none exists.
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl LinkError {
    /// Whether this error tears down the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Transport(_) | LinkError::Framing(_))
    }
}

// ---------------------------------------------------------------------------
// DisconnectReason
// ---------------------------------------------------------------------------

/// Why a session ended, as reported to the disconnect hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer disconnected on its own, or the transport dropped.
    Normal,
    /// The server operator removed the client via `disconnect_client`.
    Kicked,
    /// The idle reaper evicted the session.
    Timeout,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Normal => write!(f, "normal"),
            DisconnectReason::Kicked => write!(f, "kicked"),
            DisconnectReason::Timeout => write!(f, "timeout"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
