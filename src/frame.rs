//! Frame reader/writer for the framelink wire protocol.
//!
//! A frame is a UTF-8 JSON header terminated by two consecutive line
//! terminators, followed by exactly `ContentLength` payload bytes. This
//! implementation emits `CR LF CR LF` and accepts both that form and the
//! two-byte `LF LF` form from LF-only peers. Maximum header size is 1 MB.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, Take,
};
use tracing::trace;

use crate::error::{FramingError, LinkError, LinkResult};
use crate::message::FrameHeader;

/// Maximum header size before the delimiter must have been seen: 1 MB.
pub const MAX_HEADER_SIZE: usize = 1_048_576;

/// Returns the length of the delimiter terminating `buf`, if present.
fn delimiter_len(buf: &[u8]) -> Option<usize> {
    if buf.ends_with(b"\r\n\r\n") {
        Some(4)
    } else if buf.ends_with(b"\n\n") {
        Some(2)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Reads frames from a byte source.
///
/// All reads pass through an internal [`BufReader`], so the byte-at-a-time
/// delimiter scan does not translate into per-byte syscalls.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner: BufReader::new(inner),
        }
    }

    /// Read and parse one frame header.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
    /// End-of-stream in the middle of a header surfaces as a transport
    /// error, since the peer vanished mid-frame.
    pub async fn read_header(&mut self) -> LinkResult<Option<FrameHeader>> {
        let mut buf: Vec<u8> = Vec::with_capacity(256);

        let delim = loop {
            let byte = match self.inner.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(LinkError::Transport(e));
                }
                Err(e) => return Err(LinkError::Transport(e)),
            };
            buf.push(byte);

            if let Some(d) = delimiter_len(&buf) {
                break d;
            }
            if buf.len() > MAX_HEADER_SIZE {
                return Err(FramingError::OversizedHeader {
                    max: MAX_HEADER_SIZE,
                }
                .into());
            }
        };

        let json = &buf[..buf.len() - delim];
        let header: FrameHeader = serde_json::from_slice(json)
            .map_err(|e| FramingError::MalformedHeader(e.to_string()))?;
        header.validate()?;

        trace!(
            content_length = header.content_length,
            status = %header.status,
            "frame header read"
        );
        Ok(Some(header))
    }

    /// Read exactly `len` payload bytes into memory.
    pub async fn read_payload(&mut self, len: u64) -> LinkResult<Bytes> {
        let expected = len as usize;
        let mut buf = vec![0u8; expected];
        let mut read = 0usize;

        while read < expected {
            match self.inner.read(&mut buf[read..]).await {
                Ok(0) => {
                    return Err(FramingError::TruncatedPayload {
                        expected: len,
                        read: read as u64,
                    }
                    .into());
                }
                Ok(n) => read += n,
                Err(e) => return Err(LinkError::Transport(e)),
            }
        }
        Ok(Bytes::from(buf))
    }

    /// A bounded view over the next `len` bytes of the transport, for
    /// streamed delivery of large payloads.
    pub fn body(&mut self, len: u64) -> BoundedBody<'_> {
        let dyn_reader: &mut (dyn AsyncRead + Unpin + Send) = &mut self.inner;
        BoundedBody {
            inner: dyn_reader.take(len),
        }
    }

    /// Discard the rest of a payload the application did not drain.
    pub async fn discard(&mut self, len: u64) -> LinkResult<()> {
        if len == 0 {
            return Ok(());
        }
        let mut remaining = (&mut self.inner).take(len);
        let copied = tokio::io::copy(&mut remaining, &mut tokio::io::sink()).await?;
        if copied < len {
            return Err(FramingError::TruncatedPayload {
                expected: len,
                read: copied,
            }
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BoundedBody
// ---------------------------------------------------------------------------

/// A readable view over exactly the payload bytes of one frame.
///
/// Handed to the application for streamed delivery. Reading past the payload
/// boundary yields end-of-stream; the receiver discards whatever the
/// application leaves unread before parsing the next frame.
pub struct BoundedBody<'a> {
    inner: Take<&'a mut (dyn AsyncRead + Unpin + Send)>,
}

impl BoundedBody<'_> {
    /// Payload bytes not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl AsyncRead for BoundedBody<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

/// Writes frames to a byte sink.
///
/// The header plus delimiter goes out in a single write; the payload follows
/// in chunks of the configured buffer size, with one flush at the end.
pub struct FrameWriter<W> {
    inner: W,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        FrameWriter { inner, chunk_size }
    }

    /// Write one frame with a fully buffered payload.
    pub async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> LinkResult<()> {
        debug_assert_eq!(header.content_length, payload.len() as u64);

        let header_bytes = header.header_bytes()?;
        self.inner.write_all(&header_bytes).await?;

        for chunk in payload.chunks(self.chunk_size) {
            self.inner.write_all(chunk).await?;
        }
        self.inner.flush().await?;

        trace!(
            content_length = header.content_length,
            status = %header.status,
            "frame written"
        );
        Ok(())
    }

    /// Write one frame whose payload is drawn from a reader.
    ///
    /// Exactly `header.content_length` bytes are copied; a source that runs
    /// dry early is a caller error, because the header has already promised
    /// the full length to the peer.
    pub async fn write_frame_streaming(
        &mut self,
        header: &FrameHeader,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LinkResult<()> {
        let header_bytes = header.header_bytes()?;
        self.inner.write_all(&header_bytes).await?;

        let total = header.content_length;
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; self.chunk_size];

        while sent < total {
            let want = std::cmp::min(self.chunk_size as u64, total - sent) as usize;
            let n = body.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(LinkError::Argument(format!(
                    "payload source ended after {sent} of {total} bytes"
                )));
            }
            self.inner.write_all(&buf[..n]).await?;
            sent += n as u64;
        }
        self.inner.flush().await?;

        trace!(content_length = total, "streamed frame written");
        Ok(())
    }

    /// Flush and shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> LinkResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
