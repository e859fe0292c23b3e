//! Device collaborator boundary and the screen-state cache.
//!
//! The engine never talks to a device directly; it goes through a
//! [`DeviceFactory`]. [`AdbDevice`](crate::adb::AdbDevice) is the stock
//! implementation, and tests substitute scripted ones.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CaptureError;
use crate::types::{CaptureMethod, CaptureParams, CapturedFrame};

// ── DeviceFactory ────────────────────────────────────────────────

/// What the engine needs from a device.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// `true` when the screen is on and not behind the keyguard.
    async fn is_screen_on(&self, device_id: &str) -> Result<bool, CaptureError>;

    /// Capture one frame, trying `preferred` first when given.
    async fn get_screenshot(
        &self,
        device_id: &str,
        params: &CaptureParams,
        preferred: Option<CaptureMethod>,
    ) -> Result<CapturedFrame, CaptureError>;
}

// ── DeviceStateCache ─────────────────────────────────────────────

/// Time-bounded cache of the screen-on/unlocked probe.
///
/// Has its own lock, independent of the frame path. The lock is never held
/// across the device round-trip, so concurrent callers may both probe on a
/// cold cache; the later result wins.
pub struct DeviceStateCache {
    ttl: Duration,
    entry: Mutex<Option<(bool, Instant)>>,
}

impl DeviceStateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Cached value if still fresh, otherwise probe `device` and remember.
    ///
    /// Probe errors are returned as-is and not cached.
    pub async fn is_screen_on(
        &self,
        device: &dyn DeviceFactory,
        device_id: &str,
    ) -> Result<bool, CaptureError> {
        if let Some(on) = self.cached(Instant::now()) {
            return Ok(on);
        }
        let on = device.is_screen_on(device_id).await?;
        debug!(device_id, on, "screen state probed");
        self.store(on, Instant::now());
        Ok(on)
    }

    /// Cached value at `now`, if one exists and has not expired.
    pub fn cached(&self, now: Instant) -> Option<bool> {
        let entry = self.entry.lock().ok()?;
        match *entry {
            Some((on, at)) if now.saturating_duration_since(at) < self.ttl => Some(on),
            _ => None,
        }
    }

    pub fn store(&self, on: bool, at: Instant) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = Some((on, at));
        }
    }

    /// Forget the cached value; the next call probes the device.
    pub fn invalidate(&self) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = None;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDevice {
        probes: AtomicUsize,
        on: bool,
    }

    #[async_trait]
    impl DeviceFactory for CountingDevice {
        async fn is_screen_on(&self, _device_id: &str) -> Result<bool, CaptureError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.on)
        }

        async fn get_screenshot(
            &self,
            _device_id: &str,
            _params: &CaptureParams,
            _preferred: Option<CaptureMethod>,
        ) -> Result<CapturedFrame, CaptureError> {
            Err(CaptureError::NoFrameYet)
        }
    }

    #[tokio::test]
    async fn probe_is_cached_within_ttl() {
        let dev = CountingDevice {
            probes: AtomicUsize::new(0),
            on: false,
        };
        let cache = DeviceStateCache::new(Duration::from_secs(60));
        assert!(!cache.is_screen_on(&dev, "x").await.unwrap());
        assert!(!cache.is_screen_on(&dev, "x").await.unwrap());
        assert_eq!(dev.probes.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.is_screen_on(&dev, "x").await.unwrap();
        assert_eq!(dev.probes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = DeviceStateCache::new(Duration::from_millis(100));
        let t0 = Instant::now();
        cache.store(true, t0);
        assert_eq!(cache.cached(t0 + Duration::from_millis(50)), Some(true));
        assert_eq!(cache.cached(t0 + Duration::from_millis(150)), None);
    }
}
