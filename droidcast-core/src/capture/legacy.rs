//! Last-resort strategy for devices whose `exec-out` mangles binary
//! output: write the PNG to device storage and `adb pull` it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::adb::{CommandRunner, sanitize_device_id};
use crate::capture::CaptureStrategy;
use crate::capture::encode::encode_encoded;
use crate::error::CaptureError;
use crate::types::{CaptureMethod, CaptureParams, Frame};

const REMOTE_PATH: &str = "/sdcard/droidcast_screen.png";

static PULL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Removes the file at `path` when dropped.
struct TempFile(PathBuf);

impl TempFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.0.display(), error = %e, "temp file not removed");
            }
        }
    }
}

/// `adb shell screencap -p <remote>` followed by `adb pull`.
pub struct LegacyPullStrategy {
    runner: Arc<dyn CommandRunner>,
    local_dir: PathBuf,
}

impl LegacyPullStrategy {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_local_dir(runner, std::env::temp_dir())
    }

    pub fn with_local_dir(runner: Arc<dyn CommandRunner>, local_dir: PathBuf) -> Self {
        Self { runner, local_dir }
    }

    fn local_file(&self, device_id: &str) -> TempFile {
        TempFile(self.local_dir.join(format!(
            "droidcast-{}-{}-{}.png",
            sanitize_device_id(device_id),
            std::process::id(),
            PULL_SEQ.fetch_add(1, Ordering::Relaxed)
        )))
    }
}

#[async_trait]
impl CaptureStrategy for LegacyPullStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Legacy
    }

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError> {
        self.runner
            .run(device_id, &["shell", "screencap", "-p", REMOTE_PATH], params.timeout)
            .await?;

        let local = self.local_file(device_id);
        let local_str = local.path().to_string_lossy().into_owned();
        self.runner
            .run(device_id, &["pull", REMOTE_PATH, &local_str], params.timeout)
            .await?;

        let data = tokio::fs::read(local.path()).await?;
        encode_encoded(data, *params).await
    }
}
