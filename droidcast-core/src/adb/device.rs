//! [`DeviceFactory`] backed by `adb`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::adb::{AdbRunner, CommandRunner};
use crate::capture::{
    CaptureStrategy, GzipStrategy, LegacyPullStrategy, PngStrategy, RawStrategy, capture_bounded,
};
use crate::config::EngineConfig;
use crate::device::DeviceFactory;
use crate::error::CaptureError;
use crate::types::{CaptureMethod, CaptureParams, CapturedFrame};

/// Upper bound for each `dumpsys` call of the screen probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// ADB-backed device with the four screencap strategies.
pub struct AdbDevice {
    runner: Arc<dyn CommandRunner>,
    raw: RawStrategy,
    gzip: GzipStrategy,
    png: PngStrategy,
    legacy: LegacyPullStrategy,
}

impl AdbDevice {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_runner(Arc::new(AdbRunner::new(&config.adb_path)), config)
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, config: &EngineConfig) -> Self {
        Self {
            raw: RawStrategy::new(runner.clone(), config.black_screen_check),
            gzip: GzipStrategy::new(runner.clone(), config.black_screen_check),
            png: PngStrategy::new(runner.clone()),
            legacy: LegacyPullStrategy::new(runner.clone()),
            runner,
        }
    }

    fn strategy(&self, method: CaptureMethod) -> Option<&dyn CaptureStrategy> {
        match method {
            CaptureMethod::Raw => Some(&self.raw),
            CaptureMethod::Gzip => Some(&self.gzip),
            CaptureMethod::Png => Some(&self.png),
            CaptureMethod::Legacy => Some(&self.legacy),
            CaptureMethod::Scrcpy => None,
        }
    }

    async fn probe(&self, device_id: &str) -> Result<bool, CaptureError> {
        let power = self
            .runner
            .run(device_id, &["shell", "dumpsys", "power"], PROBE_TIMEOUT)
            .await?;
        if !is_awake(&String::from_utf8_lossy(&power)) {
            return Ok(false);
        }
        let policy = self
            .runner
            .run(device_id, &["shell", "dumpsys", "window", "policy"], PROBE_TIMEOUT)
            .await?;
        Ok(!is_keyguard_locked(&String::from_utf8_lossy(&policy)))
    }
}

/// Preferred method first, then the default fallback order, no repeats.
pub fn attempt_order(preferred: Option<CaptureMethod>) -> Vec<CaptureMethod> {
    let mut order = Vec::with_capacity(CaptureMethod::FALLBACK_ORDER.len() + 1);
    order.extend(preferred.filter(|m| *m != CaptureMethod::Scrcpy));
    for m in CaptureMethod::FALLBACK_ORDER {
        if !order.contains(&m) {
            order.push(m);
        }
    }
    order
}

#[async_trait]
impl DeviceFactory for AdbDevice {
    async fn is_screen_on(&self, device_id: &str) -> Result<bool, CaptureError> {
        match self.probe(device_id).await {
            Ok(on) => Ok(on),
            Err(e @ CaptureError::DeviceUnavailable(_)) => Err(e),
            Err(e) => {
                debug!(device_id, error = %e, "screen probe failed, assuming on");
                Ok(true)
            }
        }
    }

    async fn get_screenshot(
        &self,
        device_id: &str,
        params: &CaptureParams,
        preferred: Option<CaptureMethod>,
    ) -> Result<CapturedFrame, CaptureError> {
        let mut failed = Vec::new();
        let mut last_err = None;
        for method in attempt_order(preferred) {
            let Some(strategy) = self.strategy(method) else {
                continue;
            };
            let started = Instant::now();
            match capture_bounded(strategy, device_id, params).await {
                Ok(frame) => {
                    return Ok(CapturedFrame {
                        frame,
                        method,
                        elapsed: started.elapsed(),
                        failed,
                    });
                }
                Err(e @ CaptureError::DeviceUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(device_id, %method, error = %e, "capture method failed");
                    failed.push(method);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CaptureError::Command("no capture method available".into())))
    }
}

// ── dumpsys parsing ──────────────────────────────────────────────

/// Value of the first `key=value` token in `text`.
fn flag<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.split_whitespace()
        .find_map(|tok| tok.strip_prefix(key)?.strip_prefix('='))
}

/// `dumpsys power`: anything but Asleep/Dozing counts as awake.
pub fn is_awake(power: &str) -> bool {
    !matches!(flag(power, "mWakefulness"), Some("Asleep") | Some("Dozing"))
}

/// `dumpsys window policy`: is the keyguard in front of the user?
pub fn is_keyguard_locked(policy: &str) -> bool {
    flag(policy, "mInputRestricted") == Some("true")
        || flag(policy, "isStatusBarKeyguard") == Some("true")
        || (flag(policy, "mKeyguardDrawComplete") == Some("true")
            && flag(policy, "mKeyguardOccluded") == Some("false"))
}

// ── Tests ────────────────────────────────────────────────────────
