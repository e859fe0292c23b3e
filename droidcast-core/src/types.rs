//! Shared types for the capture and distribution pipeline.
//!
//! A [`Frame`] is the unit that flows from the capture strategies through
//! the [`FrameCache`](crate::cache::FrameCache) to every consumer. It holds
//! the already-encoded JPEG bytes, so distributing it never re-encodes.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

// ── ContentHash ──────────────────────────────────────────────────

/// 128-bit digest of a frame's encoded bytes.
///
/// Truncated BLAKE3; used for change detection and as the HTTP ETag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lower-case hex rendering (32 characters).
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// An immutable, encoded screen capture.
///
/// `width`/`height` are the device's native dimensions; `pixels` is the
/// JPEG produced after the optional resize.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Bytes,
    width: u32,
    height: u32,
    captured_at: SystemTime,
    content_hash: ContentHash,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(pixels: impl Into<Bytes>, width: u32, height: u32) -> Self {
        let pixels = pixels.into();
        let content_hash = ContentHash::of(&pixels);
        Self {
            pixels,
            width,
            height,
            captured_at: SystemTime::now(),
            content_hash,
        }
    }

    /// The same content, re-stamped. The pixel buffer is shared, not copied.
    pub fn restamped(&self, captured_at: SystemTime) -> Self {
        Self {
            pixels: self.pixels.clone(),
            width: self.width,
            height: self.height,
            captured_at,
            content_hash: self.content_hash,
        }
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    /// Capture time in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        unix_ms(self.captured_at)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero.
pub fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── CaptureMethod ────────────────────────────────────────────────

/// The ways a frame can be obtained from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    /// scrcpy producer + decoder subprocess pipeline.
    Scrcpy,
    /// `exec-out screencap` raw framebuffer.
    Raw,
    /// `screencap | gzip -1` compressed framebuffer.
    Gzip,
    /// `exec-out screencap -p` PNG.
    Png,
    /// `screencap -p` to device storage, then `adb pull`.
    Legacy,
}

impl CaptureMethod {
    /// ADB methods that compete in the latency ranking.
    pub const RANKED: [CaptureMethod; 3] =
        [CaptureMethod::Raw, CaptureMethod::Gzip, CaptureMethod::Png];

    /// Default ADB fallback order when no method has been ranked yet.
    pub const FALLBACK_ORDER: [CaptureMethod; 4] = [
        CaptureMethod::Gzip,
        CaptureMethod::Raw,
        CaptureMethod::Png,
        CaptureMethod::Legacy,
    ];

    pub fn is_ranked(self) -> bool {
        Self::RANKED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMethod::Scrcpy => "scrcpy",
            CaptureMethod::Raw => "raw",
            CaptureMethod::Gzip => "gzip",
            CaptureMethod::Png => "png",
            CaptureMethod::Legacy => "legacy",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── CaptureParams ────────────────────────────────────────────────

/// Per-call capture parameters, derived from the current settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    /// JPEG quality (1..=100).
    pub quality: u8,
    /// Frames wider than this are downscaled, preserving aspect ratio.
    pub max_width: u32,
    /// Upper bound for the whole strategy call.
    pub timeout: Duration,
}

// ── CapturedFrame ────────────────────────────────────────────────

/// A frame returned by a [`DeviceFactory`](crate::device::DeviceFactory),
/// along with the timing data the method selector feeds on.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    /// The method that produced `frame`.
    pub method: CaptureMethod,
    /// Wall time spent in the successful method.
    pub elapsed: Duration,
    /// Methods attempted (and failed) before `method` succeeded.
    pub failed: Vec<CaptureMethod>,
}

// ── CaptureResult ────────────────────────────────────────────────

/// Outcome of one capture attempt. Exactly one variant applies.
#[derive(Debug)]
pub enum CaptureResult {
    /// A frame whose content differs from the cached one.
    New(Frame),
    /// Same content as the cache; the cached timestamp was refreshed.
    Unchanged,
    /// The device screen is off or locked.
    Locked,
    /// The capture failed.
    Error(CaptureError),
}

impl CaptureResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CaptureResult::New(_) | CaptureResult::Unchanged)
    }
}

// ── StreamSettings ───────────────────────────────────────────────

/// Live-tunable stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// JPEG quality (1..=100).
    pub quality: u8,
    /// Maximum output width in pixels (> 0).
    pub max_width: u32,
    /// Target capture rate (> 0).
    pub fps: f32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            quality: 50,
            max_width: 540,
            fps: 30.0,
        }
    }
}

/// Partial update for [`StreamSettings`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub quality: Option<u8>,
    pub max_width: Option<u32>,
    pub fps: Option<f32>,
}

impl StreamSettings {
    /// Apply `update`, rejecting out-of-range values without modifying `self`.
    pub fn apply(&self, update: &SettingsUpdate) -> Result<StreamSettings, CaptureError> {
        let mut next = *self;
        if let Some(q) = update.quality {
            if !(1..=100).contains(&q) {
                return Err(CaptureError::InvalidSettings("quality must be in 1..=100"));
            }
            next.quality = q;
        }
        if let Some(w) = update.max_width {
            if w == 0 {
                return Err(CaptureError::InvalidSettings("max_width must be > 0"));
            }
            next.max_width = w;
        }
        if let Some(fps) = update.fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(CaptureError::InvalidSettings("fps must be > 0"));
            }
            next.fps = fps;
        }
        Ok(next)
    }

    /// Time budget for one loop iteration at the configured fps.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(0.01) as f64)
    }

    pub fn params(&self, timeout: Duration) -> CaptureParams {
        CaptureParams {
            quality: self.quality,
            max_width: self.max_width,
            timeout,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = ContentHash::of(b"frame-a");
        assert_eq!(a, ContentHash::of(b"frame-a"));
        assert_ne!(a, ContentHash::of(b"frame-b"));
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn restamp_keeps_content() {
        let f = Frame::new(vec![1u8, 2, 3], 10, 20);
        let later = f.captured_at() + Duration::from_millis(5);
        let g = f.restamped(later);
        assert_eq!(g.content_hash(), f.content_hash());
        assert_eq!(g.pixels(), f.pixels());
        assert_eq!(g.captured_at(), later);
        assert_eq!((g.width(), g.height()), (10, 20));
    }

    #[test]
    fn settings_update_validates() {
        let s = StreamSettings::default();
        let next = s
            .apply(&SettingsUpdate {
                fps: Some(60.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.fps, 60.0);
        assert_eq!(next.quality, s.quality);

        assert!(s.apply(&SettingsUpdate { quality: Some(0), ..Default::default() }).is_err());
        assert!(s.apply(&SettingsUpdate { quality: Some(101), ..Default::default() }).is_err());
        assert!(s.apply(&SettingsUpdate { max_width: Some(0), ..Default::default() }).is_err());
        assert!(s.apply(&SettingsUpdate { fps: Some(f32::NAN), ..Default::default() }).is_err());
        assert!(s.apply(&SettingsUpdate { fps: Some(-1.0), ..Default::default() }).is_err());
    }

    #[test]
    fn frame_interval_tracks_fps() {
        let s = StreamSettings {
            fps: 20.0,
            ..Default::default()
        };
        assert_eq!(s.frame_interval(), Duration::from_millis(50));
    }

    #[test]
    fn ranked_methods() {
        assert!(CaptureMethod::Raw.is_ranked());
        assert!(!CaptureMethod::Scrcpy.is_ranked());
        assert!(!CaptureMethod::Legacy.is_ranked());
    }
}
