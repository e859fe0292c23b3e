//! Device command execution.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::CaptureError;

/// stderr fragments that mean the device itself is gone.
const UNAVAILABLE_MARKERS: [&str; 3] = ["not found", "no devices", "offline"];

/// Runs one command against a device and returns its stdout.
///
/// Every call is bounded by `timeout`; an expired call is
/// [`CaptureError::CaptureTimeout`] and must not leave the child running.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        device_id: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Vec<u8>, CaptureError>;
}

// ── AdbRunner ────────────────────────────────────────────────────

/// [`CommandRunner`] that shells out to `adb -s <device> ...`.
#[derive(Debug, Clone)]
pub struct AdbRunner {
    adb_path: PathBuf,
}

impl AdbRunner {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for AdbRunner {
    async fn run(
        &self,
        device_id: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        trace!(device_id, ?args, "adb");
        let child = Command::new(&self.adb_path)
            .arg("-s")
            .arg(device_id)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CaptureError::DeviceUnavailable(format!(
                    "adb binary not found at {}",
                    self.adb_path.display()
                )),
                _ => CaptureError::Io(e),
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(out) => out?,
            Err(_) => return Err(CaptureError::CaptureTimeout(timeout)),
        };

        if !output.status.success() {
            return Err(classify_failure(output.status, &output.stderr));
        }
        Ok(output.stdout)
    }
}

/// Map a failed command onto the error taxonomy.
pub fn classify_failure(status: ExitStatus, stderr: &[u8]) -> CaptureError {
    let msg = String::from_utf8_lossy(stderr).trim().to_string();
    let lower = msg.to_ascii_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        CaptureError::DeviceUnavailable(msg)
    } else {
        CaptureError::Command(format!("{status}: {msg}"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn offline_device_is_unavailable() {
        let status = ExitStatus::from_raw(1 << 8);
        let e = classify_failure(status, b"error: device offline\n");
        assert!(matches!(e, CaptureError::DeviceUnavailable(_)));

        let e = classify_failure(status, b"error: no devices/emulators found");
        assert!(matches!(e, CaptureError::DeviceUnavailable(_)));
    }

    #[test]
    fn other_failures_are_command_errors() {
        let status = ExitStatus::from_raw(1 << 8);
        let e = classify_failure(status, b"permission denied");
        assert!(matches!(e, CaptureError::Command(ref m) if m.contains("permission denied")));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let runner = AdbRunner::new("/nonexistent/droidcast-adb");
        let e = runner
            .run("emulator-5554", &["shell", "true"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(e, CaptureError::DeviceUnavailable(_)));
    }
}
