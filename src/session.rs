//! Per-connection mutable state shared between the receiver loop and
//! concurrent senders.
//!
//! The transport is split at session setup: the read half (inside its
//! [`FrameReader`]) sits behind one lock, the write half behind another.
//! The write lock guarantees a frame's header and payload are contiguous on
//! the wire; the read lock protects the framer's multi-step parse. They are
//! deliberately separate so inbound and outbound traffic never serialize
//! against each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::frame::{FrameReader, FrameWriter};
use crate::transport::{PeerProbe, TransportReadHalf, TransportStream, TransportWriteHalf};

/// One connected peer: a transport split into locked halves, a cancel
/// signal, a liveness mark, and the peer probe taken before the split.
pub(crate) struct Session {
    endpoint: String,
    pub(crate) reader: Mutex<FrameReader<TransportReadHalf>>,
    pub(crate) writer: Mutex<FrameWriter<TransportWriteHalf>>,
    cancel: CancellationToken,
    dead: AtomicBool,
    probe: PeerProbe,
}

impl Session {
    /// Split `transport` and wrap it in a new session.
    pub fn new(
        endpoint: String,
        transport: TransportStream,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let probe = transport.probe();
        let (read_half, write_half) = transport.into_split();
        Arc::new(Session {
            endpoint,
            reader: Mutex::new(FrameReader::new(read_half)),
            writer: Mutex::new(FrameWriter::new(write_half, chunk_size)),
            cancel,
            dead: AtomicBool::new(false),
            probe,
        })
    }

    /// `IP:port` of the remote peer; the registry key on servers.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Best-effort liveness: false once an I/O error was observed on either
    /// half or the session was cancelled.
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Relaxed) && !self.cancel.is_cancelled()
    }

    /// Active probe of the remote peer over the raw socket. Non-blocking;
    /// run by the receiver before each read attempt.
    pub fn is_peer_alive(&self) -> bool {
        self.probe.is_peer_alive()
    }

    /// Record an observed transport failure and unblock any in-flight I/O.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    /// Flush and close the write side, if it is still usable.
    pub async fn shutdown_write(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
