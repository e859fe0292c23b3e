//! Streaming PNG deserializer for the decoder's stdout.
//!
//! The decoder writes back-to-back PNG images with no outer framing, so
//! frame boundaries are found by walking the PNG chunk structure:
//!
//! ```text
//! signature:  89 50 4E 47 0D 0A 1A 0A   (8)
//! chunk:      length: u32 BE            (4)
//!             type:   [u8; 4]           (4)
//!             data:   [u8; length]
//!             crc:    u32               (4)
//! ...         repeated until type == IEND
//! ```
//!
//! [`scan`] is a pure function over buffered bytes; [`PngStreamReader`]
//! feeds it from an `AsyncRead` with a readiness timeout before every read,
//! so a quiet or stalled decoder never blocks the caller indefinitely.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ScrcpyConfig;
use crate::error::CaptureError;

// ── Constants ────────────────────────────────────────────────────

/// PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Length + type.
const CHUNK_HEADER_LEN: usize = 8;

/// CRC trailer.
const CHUNK_TRAILER_LEN: usize = 4;

/// Bytes requested from the reader per fill.
const READ_CHUNK: usize = 64 * 1024;

// ── ScanLimits ───────────────────────────────────────────────────

/// Guards that keep a malformed stream from growing or looping forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    /// Largest accepted image, signature included.
    pub max_frame_bytes: usize,
    /// Most chunks accepted in one image.
    pub max_chunks: usize,
    /// Bytes searched for a signature before giving up.
    pub resync_window: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 10 * 1024 * 1024,
            max_chunks: 1_000,
            resync_window: 64 * 1024,
        }
    }
}

impl From<&ScrcpyConfig> for ScanLimits {
    fn from(cfg: &ScrcpyConfig) -> Self {
        Self {
            max_frame_bytes: cfg.max_frame_bytes,
            max_chunks: cfg.max_chunks,
            resync_window: cfg.resync_window,
        }
    }
}

// ── scan ─────────────────────────────────────────────────────────

/// Result of scanning the head of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// A complete image occupies `buf[..n]`.
    Complete(usize),
    /// The image (or signature) continues past the end of the buffer.
    NeedMore,
    /// `buf[..n]` precedes the next signature and should be discarded.
    Skip(usize),
}

/// Locate the first complete PNG image at the head of `buf`.
pub fn scan(buf: &[u8], limits: &ScanLimits) -> Result<Scan, CaptureError> {
    let sig_len = buf.len().min(PNG_SIGNATURE.len());
    if buf[..sig_len] != PNG_SIGNATURE[..sig_len] {
        return resync(buf, limits);
    }
    if buf.len() < PNG_SIGNATURE.len() {
        return Ok(Scan::NeedMore);
    }

    let mut pos = PNG_SIGNATURE.len();
    let mut chunks = 0usize;
    loop {
        if pos + CHUNK_HEADER_LEN > buf.len() {
            return Ok(Scan::NeedMore);
        }
        let length = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        let kind = &buf[pos + 4..pos + 8];
        if !kind.iter().all(u8::is_ascii_alphabetic) {
            return Err(CaptureError::ProtocolParse(format!(
                "invalid PNG chunk type at offset {pos}"
            )));
        }
        if length > i32::MAX as u32 {
            return Err(CaptureError::ProtocolParse(format!(
                "PNG chunk length {length} out of range"
            )));
        }

        chunks += 1;
        if chunks > limits.max_chunks {
            return Err(CaptureError::ProtocolParse(format!(
                "PNG exceeds {} chunks without IEND",
                limits.max_chunks
            )));
        }

        let end = pos + CHUNK_HEADER_LEN + length as usize + CHUNK_TRAILER_LEN;
        if end > limits.max_frame_bytes {
            return Err(CaptureError::ProtocolParse(format!(
                "PNG exceeds {} bytes without IEND",
                limits.max_frame_bytes
            )));
        }
        if end > buf.len() {
            return Ok(Scan::NeedMore);
        }
        if kind == b"IEND" {
            return Ok(Scan::Complete(end));
        }
        pos = end;
    }
}

fn resync(buf: &[u8], limits: &ScanLimits) -> Result<Scan, CaptureError> {
    let window = &buf[..buf.len().min(limits.resync_window)];
    if let Some(at) = window
        .windows(PNG_SIGNATURE.len())
        .position(|w| w == PNG_SIGNATURE)
    {
        return Ok(Scan::Skip(at));
    }
    if buf.len() >= limits.resync_window {
        return Err(CaptureError::ProtocolParse(format!(
            "no PNG signature within {} bytes",
            limits.resync_window
        )));
    }
    Ok(Scan::NeedMore)
}

/// Validate that `data` is exactly one complete PNG.
///
/// A missing IEND is reported as [`CaptureError::IncompleteData`].
pub fn check_complete(data: &[u8], limits: &ScanLimits) -> Result<(), CaptureError> {
    match scan(data, limits)? {
        Scan::Complete(_) => Ok(()),
        Scan::NeedMore => Err(CaptureError::IncompleteData {
            expected: data.len() + 1,
            actual: data.len(),
        }),
        Scan::Skip(_) => Err(CaptureError::ProtocolParse("missing PNG signature".into())),
    }
}

// ── PngStreamReader ──────────────────────────────────────────────

/// Pulls successive PNG images out of an async byte stream.
///
/// Partial data survives across calls: a `None` result ("no frame yet")
/// keeps whatever was buffered, and the next call resumes from there.
pub struct PngStreamReader<R> {
    inner: R,
    buf: BytesMut,
    limits: ScanLimits,
    poll_interval: Duration,
    max_idle_polls: u32,
}

impl<R: AsyncRead + Unpin> PngStreamReader<R> {
    pub fn new(inner: R, limits: ScanLimits, poll_interval: Duration, max_idle_polls: u32) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            limits,
            poll_interval,
            max_idle_polls: max_idle_polls.max(1),
        }
    }

    /// Next complete image, `Ok(None)` after `max_idle_polls` quiet polls.
    ///
    /// End of stream is [`CaptureError::ProcessExited`]; a malformed stream
    /// is [`CaptureError::ProtocolParse`] and discards the buffered bytes.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, CaptureError> {
        let mut idle = 0u32;
        loop {
            match scan(&self.buf, &self.limits) {
                Ok(Scan::Complete(n)) => return Ok(Some(self.buf.split_to(n).freeze())),
                Ok(Scan::Skip(n)) => {
                    self.buf.advance(n);
                    continue;
                }
                Ok(Scan::NeedMore) => {}
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }

            self.buf.reserve(READ_CHUNK);
            // `read_buf` is cancel-safe: on timeout nothing has been consumed.
            match tokio::time::timeout(self.poll_interval, self.inner.read_buf(&mut self.buf)).await
            {
                Err(_) => {
                    idle += 1;
                    if idle >= self.max_idle_polls {
                        return Ok(None);
                    }
                }
                Ok(Ok(0)) => {
                    return Err(CaptureError::ProcessExited(
                        "decoder output stream closed".into(),
                    ));
                }
                Ok(Ok(_)) => idle = 0,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Bytes currently buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────
