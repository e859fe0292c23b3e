//! Engine configuration.
//!
//! Every tuned constant of the capture path lives here as a named field so
//! deployments can override it from the server's TOML file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── EngineConfig ─────────────────────────────────────────────────

/// Configuration for [`CaptureEngine`](crate::engine::CaptureEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the `adb` binary.
    pub adb_path: PathBuf,
    /// Per-strategy capture timeout in milliseconds.
    pub capture_timeout_ms: u64,
    /// How long a screen-on/unlocked probe result stays valid.
    pub state_ttl_ms: u64,
    /// How often the method selector re-ranks ADB methods.
    pub evaluation_interval_ms: u64,
    /// Consecutive failed iterations after which the loop stops itself.
    pub max_consecutive_failures: u32,
    /// First exponential backoff step.
    pub backoff_base_ms: u64,
    /// Exponential backoff ceiling.
    pub backoff_cap_ms: u64,
    /// Fixed backoff while the screen is locked.
    pub locked_backoff_ms: u64,
    /// How long `stop_streaming` waits for the loop to exit.
    pub stop_join_timeout_ms: u64,
    /// Log frames that are almost entirely black (diagnostic only).
    pub black_screen_check: bool,
    /// Consecutive ticks without a newer frame before an MJPEG stream ends.
    pub mjpeg_max_empty_reads: u32,
    /// Outgoing messages buffered per WebSocket subscriber.
    pub push_buffer: usize,
    /// scrcpy pipeline settings.
    pub scrcpy: ScrcpyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            capture_timeout_ms: 5_000,
            state_ttl_ms: 5_000,
            evaluation_interval_ms: 30_000,
            max_consecutive_failures: 20,
            backoff_base_ms: 100,
            backoff_cap_ms: 2_000,
            locked_backoff_ms: 1_000,
            stop_join_timeout_ms: 1_000,
            black_screen_check: false,
            mjpeg_max_empty_reads: 300,
            push_buffer: 4,
            scrcpy: ScrcpyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.state_ttl_ms)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn locked_backoff(&self) -> Duration {
        Duration::from_millis(self.locked_backoff_ms)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }

    /// `min(base * 2^consecutive_errors, cap)`.
    pub fn backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 1u64 << consecutive_errors.min(20);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }
}

// ── ScrcpyConfig ─────────────────────────────────────────────────

/// Settings for the scrcpy producer + decoder pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrcpyConfig {
    /// Try the pipeline at all.
    pub enabled: bool,
    /// Producer binary.
    pub scrcpy_path: PathBuf,
    /// Decoder binary (reads the container, writes PNG frames to stdout).
    pub decoder_path: PathBuf,
    /// Longest edge requested from scrcpy.
    pub max_size: u32,
    /// Video bit rate in bits/second.
    pub bit_rate: u32,
    /// Producer frame-rate ceiling.
    pub max_fps: u32,
    /// Bounded wait for the first decoded frame.
    pub first_frame_timeout_ms: u64,
    /// Decoded-frame queue depth (oldest frame dropped when full).
    pub queue_depth: usize,
    /// Readiness-poll timeout before each read from the decoder.
    pub poll_interval_ms: u64,
    /// Longest a capture waits on an empty frame queue before falling back
    /// to adb. scrcpy sends nothing while the screen is static.
    pub frame_poll_ms: u64,
    /// "Not ready" polls tolerated before reporting no frame yet.
    pub max_idle_polls: u32,
    /// Upper bound for a single decoded frame.
    pub max_frame_bytes: usize,
    /// Upper bound for chunks in a single decoded frame.
    pub max_chunks: usize,
    /// How far to scan for the PNG signature when out of sync.
    pub resync_window: usize,
    /// SIGTERM grace period before force-killing a subprocess.
    pub terminate_grace_ms: u64,
    /// Pipeline restarts allowed per session after a mid-stream exit.
    pub max_restarts: u32,
    /// Where the named pipe is created (defaults to the system temp dir).
    pub fifo_dir: Option<PathBuf>,
}

impl Default for ScrcpyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scrcpy_path: PathBuf::from("scrcpy"),
            decoder_path: PathBuf::from("ffmpeg"),
            max_size: 720,
            bit_rate: 2_000_000,
            max_fps: 60,
            first_frame_timeout_ms: 10_000,
            queue_depth: 2,
            poll_interval_ms: 50,
            frame_poll_ms: 30,
            max_idle_polls: 20,
            max_frame_bytes: 10 * 1024 * 1024,
            max_chunks: 1_000,
            resync_window: 64 * 1024,
            terminate_grace_ms: 2_000,
            max_restarts: 3,
            fifo_dir: None,
        }
    }
}

impl ScrcpyConfig {
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_poll(&self) -> Duration {
        Duration::from_millis(self.frame_poll_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.fifo_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(5), Duration::from_millis(2_000));
        assert_eq!(cfg.backoff(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"max_consecutive_failures": 5, "scrcpy": {"enabled": false}}"#)
                .unwrap();
        assert_eq!(cfg.max_consecutive_failures, 5);
        assert!(!cfg.scrcpy.enabled);
        assert_eq!(cfg.scrcpy.queue_depth, 2);
        assert_eq!(cfg.capture_timeout(), Duration::from_secs(5));
    }
}
