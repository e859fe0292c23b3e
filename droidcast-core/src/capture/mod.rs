//! Capture strategies.
//!
//! | Module          | Purpose                                             |
//! |-----------------|-----------------------------------------------------|
//! | `framebuffer`   | Raw and gzip framebuffer dumps (12-byte LE header)  |
//! | `png`           | `screencap -p` over `exec-out`                      |
//! | `legacy`        | `screencap -p` to storage, then `adb pull`          |
//! | `scrcpy`        | Frames from the scrcpy + decoder pipeline           |
//! | `encode`        | Shared resize + JPEG encode                         |
//!
//! Every strategy turns one device round-trip into one fresh [`Frame`]; none
//! of them keep or mutate a frame they have already returned.

pub mod encode;
pub mod framebuffer;
pub mod legacy;
pub mod png;
pub mod scrcpy;

pub use framebuffer::{GzipStrategy, RawStrategy};
pub use legacy::LegacyPullStrategy;
pub use png::PngStrategy;
pub use scrcpy::ScrcpyStrategy;

use async_trait::async_trait;

use crate::error::CaptureError;
use crate::types::{CaptureMethod, CaptureParams, Frame};

/// One way of getting a frame off a device.
#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    fn method(&self) -> CaptureMethod;

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError>;
}

/// Run `strategy` with `params.timeout` as a hard deadline on the whole
/// call, decode and encode included.
pub async fn capture_bounded(
    strategy: &dyn CaptureStrategy,
    device_id: &str,
    params: &CaptureParams,
) -> Result<Frame, CaptureError> {
    match tokio::time::timeout(params.timeout, strategy.capture(device_id, params)).await {
        Ok(result) => result,
        Err(_) => Err(CaptureError::CaptureTimeout(params.timeout)),
    }
}
