//! PNG screencap strategy: slowest on-device, but every Android build
//! supports it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adb::CommandRunner;
use crate::capture::CaptureStrategy;
use crate::capture::encode::encode_encoded;
use crate::error::CaptureError;
use crate::pipeline::png_stream::{ScanLimits, check_complete};
use crate::types::{CaptureMethod, CaptureParams, Frame};

/// `adb exec-out screencap -p`.
pub struct PngStrategy {
    runner: Arc<dyn CommandRunner>,
    limits: ScanLimits,
}

impl PngStrategy {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            limits: ScanLimits {
                // A single screencap is never streamed, so any size is fine
                // as long as the chunk walk terminates.
                max_frame_bytes: usize::MAX,
                ..ScanLimits::default()
            },
        }
    }
}

#[async_trait]
impl CaptureStrategy for PngStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Png
    }

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError> {
        let data = self
            .runner
            .run(device_id, &["exec-out", "screencap", "-p"], params.timeout)
            .await?;
        check_complete(&data, &self.limits)?;
        encode_encoded(data, *params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{Reply, ScriptedRunner, png_image};
    use std::time::Duration;

    fn params() -> CaptureParams {
        CaptureParams {
            quality: 60,
            max_width: 10,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn decodes_png_screencap() {
        let runner =
            ScriptedRunner::new().on("exec-out screencap -p", Reply::Bytes(png_image(30, 12)));
        let frame = PngStrategy::new(Arc::new(runner))
            .capture("dev", &params())
            .await
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (30, 12));
    }

    #[tokio::test]
    async fn truncated_png_is_incomplete() {
        let mut png = png_image(30, 12);
        png.truncate(png.len() - 12);
        let runner = ScriptedRunner::new().on("exec-out screencap -p", Reply::Bytes(png));
        let err = PngStrategy::new(Arc::new(runner))
            .capture("dev", &params())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::IncompleteData { .. }));
    }
}
