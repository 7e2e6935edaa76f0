//! Unified byte-stream abstraction over plain TCP and TLS.
//!
//! Both framelink endpoints speak to a [`TransportStream`], which is split
//! into independently lockable read and write halves at session setup so the
//! receiver loop and concurrent senders never contend on one lock. A
//! [`PeerProbe`] taken before the split carries the raw socket handle for
//! the non-blocking peer-liveness check the receiver runs before each read.

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// A bidirectional byte stream: plain TCP, or TLS in either role.
pub enum TransportStream {
    Plain(TcpStream),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// The read side of a split transport.
pub type TransportReadHalf = ReadHalf<TransportStream>;
/// The write side of a split transport.
pub type TransportWriteHalf = WriteHalf<TransportStream>;

impl TransportStream {
    /// The remote peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportStream::Plain(s) => s.peer_addr(),
            TransportStream::TlsServer(s) => s.get_ref().0.peer_addr(),
            TransportStream::TlsClient(s) => s.get_ref().0.peer_addr(),
        }
    }

    /// Whether this transport is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        !matches!(self, TransportStream::Plain(_))
    }

    /// A handle for the non-blocking peer-liveness probe.
    ///
    /// Taken before [`into_split`](Self::into_split); the handle is only
    /// valid while the owner still holds both halves of this transport.
    pub fn probe(&self) -> PeerProbe {
        #[cfg(unix)]
        {
            let fd = match self {
                TransportStream::Plain(s) => s.as_raw_fd(),
                TransportStream::TlsServer(s) => s.get_ref().0.as_raw_fd(),
                TransportStream::TlsClient(s) => s.get_ref().0.as_raw_fd(),
            };
            PeerProbe { fd }
        }
        #[cfg(not(unix))]
        {
            PeerProbe {}
        }
    }

    /// Best-effort check that the remote peer is still reachable.
    pub fn is_peer_alive(&self) -> bool {
        self.probe().is_peer_alive()
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (TransportReadHalf, TransportWriteHalf) {
        tokio::io::split(self)
    }
}

// ---------------------------------------------------------------------------
// PeerProbe
// ---------------------------------------------------------------------------

/// Non-blocking peer-liveness probe over the raw socket.
///
/// Algorithm: attempt a zero-byte send — success means the socket has seen
/// no error. If the send fails, poll the socket for readiness and peek a
/// single byte of the receive buffer; zero bytes returned on a ready socket
/// is a half-closed peer. The probe never blocks and never consumes data,
/// so it is safe to run between reads on the same socket. For TLS
/// transports the peek sees ciphertext, which is fine — only the
/// zero-length result matters.
///
/// Holds a raw handle into the owning session's socket; must not be used
/// after that session drops its transport halves.
#[derive(Debug, Clone, Copy)]
pub struct PeerProbe {
    #[cfg(unix)]
    fd: RawFd,
}

impl PeerProbe {
    #[cfg(unix)]
    pub fn is_peer_alive(&self) -> bool {
        // Zero-byte send: succeeds on any socket without a pending error.
        let sent =
            unsafe { libc::send(self.fd, std::ptr::null(), 0, libc::MSG_NOSIGNAL) };
        if sent == 0 {
            return true;
        }

        // Send failed: poll for writability and inspect a one-byte peek.
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLOUT,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if ready < 0 {
            return false;
        }
        if ready == 0 {
            // Nothing observable yet; let the next read surface the error.
            return true;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return false;
        }
        if pollfd.revents & libc::POLLIN != 0 {
            let mut byte = 0u8;
            let peeked = unsafe {
                libc::recv(
                    self.fd,
                    (&mut byte as *mut u8).cast::<libc::c_void>(),
                    1,
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };
            // Zero bytes from a readable socket: the peer half-closed.
            if peeked == 0 {
                return false;
            }
            if peeked < 0 {
                let err = io::Error::last_os_error();
                return err.kind() == io::ErrorKind::WouldBlock;
            }
            return true;
        }
        pollfd.revents & libc::POLLOUT != 0
    }

    #[cfg(not(unix))]
    pub fn is_peer_alive(&self) -> bool {
        true
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TransportStream::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
