//! One streaming session: the per-device state and its capture loop.
//!
//! A session is created by `start_streaming` and thrown away by
//! `stop_streaming`; nothing in it is reused by the next session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::FrameCache;
use crate::capture::{CaptureStrategy, ScrcpyStrategy};
use crate::config::EngineConfig;
use crate::device::{DeviceFactory, DeviceStateCache};
use crate::distribute::PushHub;
use crate::error::{CaptureError, ErrorClass};
use crate::listener::ListenerRegistry;
use crate::selector::MethodSelector;
use crate::types::{CaptureMethod, CaptureResult, Frame, StreamSettings};

/// Running totals for one session.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub new_frames: AtomicU64,
    pub unchanged: AtomicU64,
    pub locked: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSnapshot {
    pub new_frames: u64,
    pub unchanged: u64,
    pub locked: u64,
    pub errors: u64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            new_frames: self.new_frames.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            locked: self.locked.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct Session {
    pub device_id: String,
    pub cache: FrameCache,
    pub counters: SessionCounters,
    pub selector: Mutex<MethodSelector>,
    pub cancel: CancellationToken,
    device: Arc<dyn DeviceFactory>,
    config: Arc<EngineConfig>,
    settings: watch::Receiver<StreamSettings>,
    screen: DeviceStateCache,
    scrcpy: ScrcpyStrategy,
    listeners: Arc<ListenerRegistry>,
    push: Arc<PushHub>,
    capture_lock: tokio::sync::Mutex<()>,
    streaming: AtomicBool,
}

impl Session {
    pub fn new(
        device_id: &str,
        device: Arc<dyn DeviceFactory>,
        config: Arc<EngineConfig>,
        settings: watch::Receiver<StreamSettings>,
        listeners: Arc<ListenerRegistry>,
        push: Arc<PushHub>,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            device_id: device_id.to_string(),
            cache: FrameCache::new(),
            counters: SessionCounters::default(),
            selector: Mutex::new(MethodSelector::new(
                config.evaluation_interval(),
                config.capture_timeout(),
            )),
            screen: DeviceStateCache::new(config.state_ttl()),
            scrcpy: ScrcpyStrategy::new(config.scrcpy.clone(), cancel.clone()),
            cancel,
            device,
            config,
            settings,
            listeners,
            push,
            capture_lock: tokio::sync::Mutex::new(()),
            streaming: AtomicBool::new(true),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stopped(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn shutdown_pipeline(&self) {
        self.scrcpy.shutdown().await;
    }

    /// One full capture cycle: screen check, acquire, commit, fan out.
    ///
    /// Cycles never overlap; a call made while the loop is mid-capture
    /// waits for it.
    pub async fn capture_once(&self) -> CaptureResult {
        let _cycle = self.capture_lock.lock().await;

        match self.screen.is_screen_on(&*self.device, &self.device_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.cache.mark_locked();
                self.counters.locked.fetch_add(1, Ordering::Relaxed);
                return CaptureResult::Locked;
            }
            Err(e) => return self.fail(e),
        }

        let frame = match self.acquire().await {
            Ok(frame) => frame,
            Err(CaptureError::ScreenLocked) => {
                self.screen.invalidate();
                self.cache.mark_locked();
                self.counters.locked.fetch_add(1, Ordering::Relaxed);
                return CaptureResult::Locked;
            }
            Err(e) => return self.fail(e),
        };

        let result = self.cache.commit(frame);
        match &result {
            CaptureResult::New(_) => {
                self.counters.new_frames.fetch_add(1, Ordering::Relaxed);
                self.listeners.notify(&self.device_id);
            }
            _ => {
                self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !self.push.is_empty() {
            if let Some(latest) = self.cache.latest() {
                self.push.broadcast(&latest);
            }
        }
        result
    }

    fn fail(&self, e: CaptureError) -> CaptureResult {
        self.cache.mark_failed(e.kind());
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        CaptureResult::Error(e)
    }

    /// scrcpy first when usable, then the ADB methods starting with the
    /// fastest known one.
    async fn acquire(&self) -> Result<Frame, CaptureError> {
        let params = self.settings.borrow().params(self.config.capture_timeout());

        if self.scrcpy.is_available().await {
            let started = Instant::now();
            match self.scrcpy.capture(&self.device_id, &params).await {
                Ok(frame) => {
                    self.record(CaptureMethod::Scrcpy, Some(started.elapsed()));
                    return Ok(frame);
                }
                Err(e) => debug!(device_id = %self.device_id, error = %e, "scrcpy capture missed"),
            }
        }

        let preferred = self
            .selector
            .lock()
            .ok()
            .and_then(|mut s| s.recommended(Instant::now()));
        match self
            .device
            .get_screenshot(&self.device_id, &params, preferred)
            .await
        {
            Ok(got) => {
                for m in &got.failed {
                    self.record(*m, None);
                }
                self.record(got.method, Some(got.elapsed));
                Ok(got.frame)
            }
            Err(e) => {
                self.record(preferred.unwrap_or(CaptureMethod::FALLBACK_ORDER[0]), None);
                Err(e)
            }
        }
    }

    /// `None` records a failure.
    fn record(&self, method: CaptureMethod, elapsed: Option<Duration>) {
        if let Ok(mut sel) = self.selector.lock() {
            match elapsed {
                Some(d) => sel.record(method, d),
                None => sel.record_failure(method),
            }
        }
    }
}

// ── Capture loop ─────────────────────────────────────────────────

/// Drive `session` until cancelled, the device disappears, or too many
/// consecutive attempts fail.
pub async fn run(session: Arc<Session>, mut settings: watch::Receiver<StreamSettings>) {
    let cfg = session.config.clone();
    let device_id = session.device_id.clone();
    info!(%device_id, "capture loop started");

    let mut failures = 0u32;
    let mut errors = 0u32;
    let mut last_kind: Option<&'static str> = None;

    loop {
        if session.cancel.is_cancelled() {
            break;
        }
        let started = tokio::time::Instant::now();
        let result = tokio::select! {
            _ = session.cancel.cancelled() => break,
            r = session.capture_once() => r,
        };

        let backoff = match &result {
            CaptureResult::New(_) | CaptureResult::Unchanged => {
                if failures > 0 {
                    info!(%device_id, after = failures, "capture recovered");
                }
                failures = 0;
                errors = 0;
                last_kind = None;
                None
            }
            CaptureResult::Locked => {
                failures += 1;
                log_failure(&device_id, &mut last_kind, "screen_locked", None);
                Some(cfg.locked_backoff())
            }
            CaptureResult::Error(e) => {
                if e.class() == ErrorClass::Unavailable {
                    error!(%device_id, error = %e, "device unavailable, stopping capture loop");
                    break;
                }
                failures += 1;
                log_failure(&device_id, &mut last_kind, e.kind(), Some(e));
                let b = cfg.backoff(errors);
                errors = errors.saturating_add(1);
                Some(b)
            }
        };

        if failures >= cfg.max_consecutive_failures {
            warn!(%device_id, failures, "too many consecutive failures, stopping capture loop");
            break;
        }
        if !pace(started, backoff, &mut settings, &session.cancel).await {
            break;
        }
    }

    session.mark_stopped();
    session.shutdown_pipeline().await;
    info!(%device_id, "capture loop stopped");
}

fn log_failure(
    device_id: &str,
    last_kind: &mut Option<&'static str>,
    kind: &'static str,
    err: Option<&CaptureError>,
) {
    let detail = err.map(ToString::to_string).unwrap_or_default();
    if *last_kind != Some(kind) {
        warn!(device_id, kind, error = %detail, "capture failed");
        *last_kind = Some(kind);
    } else {
        debug!(device_id, kind, error = %detail, "capture failed again");
    }
}

/// Sleep until the next iteration is due. The deadline is
/// `started + frame interval`, pushed out to `now + backoff` after a
/// failure, and recomputed whenever the settings change mid-sleep.
///
/// Returns `false` if cancelled.
async fn pace(
    started: tokio::time::Instant,
    backoff: Option<Duration>,
    settings: &mut watch::Receiver<StreamSettings>,
    cancel: &CancellationToken,
) -> bool {
    let backoff_until = backoff.map(|b| tokio::time::Instant::now() + b);
    let mut watching = true;
    loop {
        let interval = settings.borrow_and_update().frame_interval();
        let mut deadline = started + interval;
        if let Some(b) = backoff_until {
            deadline = deadline.max(b);
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = settings.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pace_recomputes_on_settings_change() {
        let (tx, mut rx) = watch::channel(StreamSettings {
            fps: 1.0,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let sleeper = tokio::spawn({
            let cancel = cancel.clone();
            async move { (pace(started, None, &mut rx, &cancel).await, tokio::time::Instant::now()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_modify(|s| s.fps = 50.0);

        let (ok, woke) = sleeper.await.unwrap();
        assert!(ok);
        assert!(woke - started < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn pace_honours_backoff_and_cancel() {
        let (_tx, mut rx) = watch::channel(StreamSettings::default());
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(pace(started, Some(Duration::from_millis(500)), &mut rx, &cancel).await);
        assert!(tokio::time::Instant::now() - started >= Duration::from_millis(500));

        cancel.cancel();
        assert!(!pace(tokio::time::Instant::now(), None, &mut rx, &cancel).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_scrcpy_falls_back_to_adb_without_waiting_out_the_timeout() {
        use crate::test_util::{fake_pipeline, temp_dir};
        use crate::types::{CaptureParams, CapturedFrame};
        use async_trait::async_trait;

        struct AdbOnly;

        #[async_trait]
        impl DeviceFactory for AdbOnly {
            async fn is_screen_on(&self, _: &str) -> Result<bool, CaptureError> {
                Ok(true)
            }

            async fn get_screenshot(
                &self,
                _: &str,
                _: &CaptureParams,
                _: Option<CaptureMethod>,
            ) -> Result<CapturedFrame, CaptureError> {
                Ok(CapturedFrame {
                    frame: Frame::new(vec![7u8; 16], 8, 8),
                    method: CaptureMethod::Raw,
                    elapsed: Duration::from_millis(1),
                    failed: Vec::new(),
                })
            }
        }

        let dir = temp_dir("session-scrcpy");
        let mut config = EngineConfig::default();
        config.capture_timeout_ms = 3_000;
        config.scrcpy = fake_pipeline(&dir, "exec sleep 30");
        let fifo_dir = config.scrcpy.fifo_dir();
        let (_tx, rx) = watch::channel(StreamSettings::default());
        let session = Session::new(
            "dev",
            Arc::new(AdbOnly),
            Arc::new(config),
            rx,
            Arc::new(ListenerRegistry::new()),
            Arc::new(PushHub::new(4)),
        );

        match session.capture_once().await {
            CaptureResult::New(frame) => assert_eq!(frame.width(), 4),
            other => panic!("expected a scrcpy frame, got {other:?}"),
        }

        // The pipeline is up but has nothing new; adb answers instead.
        let started = Instant::now();
        match session.capture_once().await {
            CaptureResult::New(frame) => assert_eq!(frame.width(), 8),
            other => panic!("expected an adb frame, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());

        session.shutdown_pipeline().await;
        assert_eq!(std::fs::read_dir(&fifo_dir).unwrap().count(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
