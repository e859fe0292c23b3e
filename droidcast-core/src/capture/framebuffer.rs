//! Raw framebuffer strategies (`screencap` without `-p`).
//!
//! Wire format, little-endian:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────────┐
//! │ width    │ height   │ format   │ pixels                      │
//! │ u32 (4)  │ u32 (4)  │ u32 (4)  │ width * height * 4 (RGBA)   │
//! └──────────┴──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! Only format `1` (RGBA8888) is accepted and the pixel payload must be
//! exactly the advertised size.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::adb::CommandRunner;
use crate::capture::CaptureStrategy;
use crate::capture::encode::encode_rgba;
use crate::error::CaptureError;
use crate::types::{CaptureMethod, CaptureParams, Frame};

/// Size of the header that precedes the pixel data.
pub const HEADER_LEN: usize = 12;

/// RGBA8888, the only pixel format understood.
pub const FORMAT_RGBA_8888: u32 = 1;

// ── FramebufferHeader ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferHeader {
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

impl FramebufferHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, CaptureError> {
        if buf.len() < HEADER_LEN {
            return Err(CaptureError::IncompleteData {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            width: u32_at(0),
            height: u32_at(4),
            format: u32_at(8),
        })
    }

    /// Bytes of pixel data the header announces; `None` if that does not
    /// fit in `usize`.
    pub fn pixel_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

/// Split a framebuffer dump into header and validated pixel slice.
pub fn parse_framebuffer(data: &[u8]) -> Result<(FramebufferHeader, &[u8]), CaptureError> {
    let header = FramebufferHeader::decode(data)?;
    if header.format != FORMAT_RGBA_8888 {
        return Err(CaptureError::UnsupportedFormat(header.format));
    }
    let expected = header.pixel_len().ok_or_else(|| {
        CaptureError::ProtocolParse(format!(
            "framebuffer dimensions {}x{} overflow",
            header.width, header.height
        ))
    })?;
    let pixels = &data[HEADER_LEN..];
    if pixels.len() != expected {
        return Err(CaptureError::IncompleteData {
            expected,
            actual: pixels.len(),
        });
    }
    Ok((header, pixels))
}

/// Largest decompressed dump accepted: a 4096x4096 RGBA framebuffer.
pub const MAX_DUMP_LEN: usize = HEADER_LEN + 4096 * 4096 * 4;

/// Inflate a compressed dump: gzip first, then zlib, then bare deflate.
///
/// Output beyond `limit` bytes is never buffered; such a dump is rejected.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CaptureError> {
    fn inflate(reader: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.take(limit as u64 + 1).read_to_end(&mut out)?;
        Ok(out)
    }

    let out = inflate(GzDecoder::new(data), limit)
        .or_else(|_| inflate(ZlibDecoder::new(data), limit))
        .or_else(|_| inflate(DeflateDecoder::new(data), limit))
        .map_err(|e| CaptureError::ProtocolParse(format!("undecodable compressed framebuffer: {e}")))?;
    if out.len() > limit {
        return Err(CaptureError::ProtocolParse(format!(
            "decompressed framebuffer exceeds {limit} bytes"
        )));
    }
    Ok(out)
}

async fn frame_from_dump(
    data: &[u8],
    params: &CaptureParams,
    black_screen_check: bool,
) -> Result<Frame, CaptureError> {
    let (header, pixels) = parse_framebuffer(data)?;
    encode_rgba(
        pixels.to_vec(),
        header.width,
        header.height,
        *params,
        black_screen_check,
    )
    .await
}

// ── RawStrategy ──────────────────────────────────────────────────

/// `adb exec-out screencap`.
pub struct RawStrategy {
    runner: Arc<dyn CommandRunner>,
    black_screen_check: bool,
}

impl RawStrategy {
    pub fn new(runner: Arc<dyn CommandRunner>, black_screen_check: bool) -> Self {
        Self {
            runner,
            black_screen_check,
        }
    }
}

#[async_trait]
impl CaptureStrategy for RawStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Raw
    }

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError> {
        let data = self
            .runner
            .run(device_id, &["exec-out", "screencap"], params.timeout)
            .await?;
        frame_from_dump(&data, params, self.black_screen_check).await
    }
}

// ── GzipStrategy ─────────────────────────────────────────────────

/// `adb shell "screencap | gzip -1"`: less data over the wire at the cost
/// of on-device compression.
pub struct GzipStrategy {
    runner: Arc<dyn CommandRunner>,
    black_screen_check: bool,
}

impl GzipStrategy {
    pub fn new(runner: Arc<dyn CommandRunner>, black_screen_check: bool) -> Self {
        Self {
            runner,
            black_screen_check,
        }
    }
}

#[async_trait]
impl CaptureStrategy for GzipStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Gzip
    }

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError> {
        let compressed = self
            .runner
            .run(device_id, &["shell", "screencap | gzip -1"], params.timeout)
            .await?;
        let data = tokio::task::spawn_blocking(move || decompress(&compressed, MAX_DUMP_LEN)).await??;
        frame_from_dump(&data, params, self.black_screen_check).await
    }
}

// ── Tests ────────────────────────────────────────────────────────
