//! Sentinel-delimited message framing over a Unix domain socket.
//!
//! Every message on the wire is its payload followed by [`SENTINEL`].
//! Payloads that contain the sentinel's first byte are rejected at send
//! time rather than escaped; the JSON codec never produces raw control
//! bytes, so a rejection here means a bug in the caller, not user input.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Frame delimiter: ASCII record separator followed by a newline.
pub const SENTINEL: &[u8] = b"\x1e\n";

const READ_CHUNK: usize = 4096;

/// Errors from the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The peer closed the connection before a full frame arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("payload contains the frame sentinel byte 0x1e")]
    SentinelInPayload,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A Unix stream carrying sentinel-delimited messages.
///
/// Holds at most one in-progress message of buffered bytes; anything read
/// past a sentinel is kept for the next [`receive`](Self::receive) call.
pub struct FramedStream {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl FramedStream {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Write one message followed by the sentinel. Returns the number of
    /// bytes written including the sentinel.
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize, FramingError> {
        if payload.contains(&SENTINEL[0]) {
            return Err(FramingError::SentinelInPayload);
        }
        self.stream.write_all(payload).await?;
        self.stream.write_all(SENTINEL).await?;
        self.stream.flush().await?;
        Ok(payload.len() + SENTINEL.len())
    }

    /// Read until one full frame is available and return its payload with
    /// the sentinel stripped.
    ///
    /// A zero-byte read before the sentinel is observed means the peer is
    /// gone and can never complete the frame; that fails immediately with
    /// [`FramingError::ConnectionClosed`]. Non-zero partial reads keep
    /// accumulating.
    pub async fn receive(&mut self) -> Result<Vec<u8>, FramingError> {
        loop {
            if let Some(frame) = extract_frame(&mut self.buf) {
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(FramingError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Shut down the write half, signalling end-of-session to the peer.
    pub async fn close(&mut self) -> Result<(), FramingError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Split the first complete frame off the front of `buf`, if present.
///
/// Returns the payload with the sentinel stripped; `buf` retains any bytes
/// that followed it. Exposed for fuzzing the splitter against arbitrary
/// byte soup.
pub fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.windows(SENTINEL.len()).position(|w| w == SENTINEL)?;
    let payload = buf[..pos].to_vec();
    buf.drain(..pos + SENTINEL.len());
    Some(payload)
}
