//! Error types for the capture engine.
//!
//! Every strategy, pipeline and cache operation returns
//! `Result<T, CaptureError>`. Nothing on the capture path panics or uses
//! errors for control flow; callers look at [`CaptureError::class`] to
//! decide whether to retry, back off, or give up.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the capture engine.
#[derive(Debug, Error)]
pub enum CaptureError {
    // ── Device Errors ────────────────────────────────────────────
    /// No device is attached, or adb reports it offline.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The screen is off or the keyguard is showing.
    #[error("screen is locked")]
    ScreenLocked,

    /// A device command exited with a non-zero status.
    #[error("device command failed: {0}")]
    Command(String),

    // ── Timing Errors ────────────────────────────────────────────
    /// A capture call exceeded its deadline.
    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    /// The scrcpy pipeline is running but has not produced a frame yet.
    #[error("no frame available yet")]
    NoFrameYet,

    // ── Protocol Errors ──────────────────────────────────────────
    /// The framebuffer header advertised a pixel format other than RGBA8888.
    #[error("unsupported framebuffer format: {0}")]
    UnsupportedFormat(u32),

    /// The payload length does not match the advertised dimensions.
    #[error("incomplete data: expected {expected} bytes, got {actual}")]
    IncompleteData { expected: usize, actual: usize },

    /// A byte stream could not be parsed.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// Image decoding or encoding failed.
    #[error("image error: {0}")]
    Image(String),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// A producer or decoder subprocess exited.
    #[error("process exited: {0}")]
    ProcessExited(String),

    /// The scrcpy pipeline could not be brought up.
    #[error("pipeline startup failed: {0}")]
    PipelineStartupFailure(String),

    // ── Application Errors ───────────────────────────────────────
    /// A settings update carried an out-of-range value.
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    /// The underlying I/O layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Surfaced immediately, never retried.
    Unavailable,
    /// Screen locked: longer, fixed backoff.
    Locked,
    /// Retried with exponential backoff up to the failure threshold.
    Retryable,
    /// Pipeline could not start; fall back to ADB strategies.
    Startup,
}

impl CaptureError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CaptureError::DeviceUnavailable(_) => ErrorClass::Unavailable,
            CaptureError::ScreenLocked => ErrorClass::Locked,
            CaptureError::PipelineStartupFailure(_) => ErrorClass::Startup,
            _ => ErrorClass::Retryable,
        }
    }

    /// Short stable label for logs and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::DeviceUnavailable(_) => "device_unavailable",
            CaptureError::ScreenLocked => "screen_locked",
            CaptureError::Command(_) => "command",
            CaptureError::CaptureTimeout(_) => "capture_timeout",
            CaptureError::NoFrameYet => "no_frame_yet",
            CaptureError::UnsupportedFormat(_) => "unsupported_format",
            CaptureError::IncompleteData { .. } => "incomplete_data",
            CaptureError::ProtocolParse(_) => "protocol_parse",
            CaptureError::Image(_) => "image",
            CaptureError::ProcessExited(_) => "process_exited",
            CaptureError::PipelineStartupFailure(_) => "pipeline_startup",
            CaptureError::InvalidSettings(_) => "invalid_settings",
            CaptureError::Io(_) => "io",
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<image::ImageError> for CaptureError {
    fn from(e: image::ImageError) -> Self {
        CaptureError::Image(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CaptureError {
    fn from(e: tokio::task::JoinError) -> Self {
        CaptureError::Image(format!("encode task failed: {e}"))
    }
}
