//! The engine's control surface.
//!
//! A [`CaptureEngine`] is constructed explicitly and shared by reference
//! (usually in an `Arc`) with whatever drives it: HTTP handlers, an agent,
//! tests. It runs at most one capture loop at a time.
//!
//! ```text
//! start_streaming("dev") ──▶ Session { FrameCache, DeviceStateCache, ... }
//!                                   │ spawn
//!                                   ▼
//!                             capture loop ──▶ FrameCache ──▶ pull / push / mjpeg
//! stop_streaming() ──▶ cancel + bounded join
//! ```

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::cache::{CaptureStatus, Snapshot};
use crate::config::EngineConfig;
use crate::device::DeviceFactory;
use crate::distribute::{self, MjpegStream, PullRequest, PullResponse, PullStatus, PushHub};
use crate::error::CaptureError;
use crate::listener::{ChangeListener, ListenerId, ListenerRegistry};
use crate::selector::MethodTiming;
use crate::session::{self, CounterSnapshot, Session};
use crate::types::{CaptureMethod, CaptureResult, SettingsUpdate, StreamSettings, unix_ms};

/// Serializable view of the engine for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub streaming: bool,
    pub device_id: Option<String>,
    pub settings: StreamSettings,
    pub capture: Option<CaptureStatus>,
    pub last_frame_ms: Option<u64>,
    pub recommended_method: Option<CaptureMethod>,
    pub ranking: Vec<MethodTiming>,
    pub counters: CounterSnapshot,
    pub subscribers: usize,
    pub listeners: usize,
}

pub struct CaptureEngine {
    device: Arc<dyn DeviceFactory>,
    config: Arc<EngineConfig>,
    settings: watch::Sender<StreamSettings>,
    listeners: Arc<ListenerRegistry>,
    push: Arc<PushHub>,
    /// Current session, for cheap synchronous reads.
    current: RwLock<Option<Arc<Session>>>,
    /// Loop task; its lock also serializes start/stop.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureEngine {
    pub fn new(device: Arc<dyn DeviceFactory>, config: EngineConfig) -> Self {
        Self::with_settings(device, config, StreamSettings::default())
    }

    pub fn with_settings(
        device: Arc<dyn DeviceFactory>,
        config: EngineConfig,
        settings: StreamSettings,
    ) -> Self {
        let (settings, _) = watch::channel(settings);
        Self {
            device,
            push: Arc::new(PushHub::new(config.push_buffer)),
            config: Arc::new(config),
            settings,
            listeners: Arc::new(ListenerRegistry::new()),
            current: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start capturing `device_id`.
    ///
    /// A no-op if that device is already streaming. A session for another
    /// device, or a dead one, is stopped first.
    pub async fn start_streaming(&self, device_id: &str) -> Result<(), CaptureError> {
        if device_id.trim().is_empty() {
            return Err(CaptureError::DeviceUnavailable("empty device id".into()));
        }
        let mut task = self.task.lock().await;
        if let Some(s) = self.session() {
            if s.device_id == device_id && s.is_streaming() {
                return Ok(());
            }
        }
        self.shutdown(&mut task).await;

        let session = Arc::new(Session::new(
            device_id,
            self.device.clone(),
            self.config.clone(),
            self.settings.subscribe(),
            self.listeners.clone(),
            self.push.clone(),
        ));
        *task = Some(tokio::spawn(session::run(
            session.clone(),
            self.settings.subscribe(),
        )));
        self.set_session(Some(session));
        info!(device_id, "streaming started");
        Ok(())
    }

    /// Stop the capture loop and discard the session.
    ///
    /// Returns within `stop_join_timeout`. The loop gets that long to exit
    /// and is aborted past it; whatever budget remains goes to terminating
    /// the scrcpy pipeline, whose children are killed outright once it runs
    /// out. No capture is in flight once this returns.
    pub async fn stop_streaming(&self) {
        let mut task = self.task.lock().await;
        self.shutdown(&mut task).await;
    }

    async fn shutdown(&self, task: &mut Option<JoinHandle<()>>) {
        let Some(session) = self.session() else {
            return;
        };
        session.cancel.cancel();
        let limit = self.config.stop_join_timeout();
        let deadline = Instant::now() + limit;
        if let Some(mut handle) = task.take() {
            if time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(device_id = %session.device_id, ?limit, "capture loop slow to stop, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        session.mark_stopped();
        // Dropping a half-stopped pipeline kills its children and unlinks the FIFO.
        if time::timeout_at(deadline, session.shutdown_pipeline()).await.is_err() {
            warn!(device_id = %session.device_id, "scrcpy pipeline slow to stop, killed");
        }
        self.set_session(None);
        info!(device_id = %session.device_id, "streaming stopped");
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.current.read().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<Arc<Session>>) {
        if let Ok(mut cur) = self.current.write() {
            *cur = session;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.session().is_some_and(|s| s.is_streaming())
    }

    pub fn device_id(&self) -> Option<String> {
        self.session().map(|s| s.device_id.clone())
    }

    // ── Capture ──────────────────────────────────────────────────

    /// Run one capture cycle now, outside the loop's schedule.
    pub async fn capture(&self) -> CaptureResult {
        match self.session() {
            Some(s) if s.is_streaming() => s.capture_once().await,
            _ => CaptureResult::Error(CaptureError::DeviceUnavailable(
                "no active streaming session".into(),
            )),
        }
    }

    // ── Settings ─────────────────────────────────────────────────

    pub fn settings(&self) -> StreamSettings {
        *self.settings.borrow()
    }

    /// Apply `update`; the loop picks it up on its next pacing decision.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<StreamSettings, CaptureError> {
        let next = self.settings.borrow().apply(&update)?;
        self.settings.send_replace(next);
        info!(quality = next.quality, max_width = next.max_width, fps = next.fps, "settings updated");
        Ok(next)
    }

    // ── Listeners ────────────────────────────────────────────────

    pub fn register_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    // ── Consumers ────────────────────────────────────────────────

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.session().map(|s| s.cache.snapshot())
    }

    /// Answer an HTTP pull from the cache.
    pub fn latest(&self, req: &PullRequest) -> PullResponse {
        match self.snapshot() {
            Some(snap) => distribute::respond(&snap, req),
            None => PullResponse {
                status: PullStatus::Unavailable,
                headers: vec![("Cache-Control", "no-cache".into())],
                body: Default::default(),
            },
        }
    }

    /// MJPEG body for the current session, `None` when not streaming.
    pub fn mjpeg(&self) -> Option<MjpegStream> {
        let s = self.session().filter(|s| s.is_streaming())?;
        Some(distribute::mjpeg_stream(
            s.cache.subscribe(),
            self.settings.subscribe(),
            self.config.mjpeg_max_empty_reads,
        ))
    }

    pub fn push_hub(&self) -> Arc<PushHub> {
        self.push.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        let session = self.session();
        let snap = session.as_ref().map(|s| s.cache.snapshot());
        let (recommended_method, ranking) = session
            .as_ref()
            .and_then(|s| s.selector.lock().ok().map(|mut sel| {
                (sel.recommended(std::time::Instant::now()), sel.ranking())
            }))
            .unwrap_or_default();
        EngineStatus {
            streaming: session.as_ref().is_some_and(|s| s.is_streaming()),
            device_id: session.as_ref().map(|s| s.device_id.clone()),
            settings: self.settings(),
            capture: snap.as_ref().map(|s| s.status),
            last_frame_ms: snap
                .as_ref()
                .and_then(|s| s.frame.as_ref())
                .map(|f| unix_ms(f.captured_at())),
            recommended_method,
            ranking,
            counters: session.as_ref().map(|s| s.counters.snapshot()).unwrap_or_default(),
            subscribers: self.push.len(),
            listeners: self.listeners.len(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CaptureParams, CapturedFrame, Frame};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticDevice;

    #[async_trait]
    impl DeviceFactory for StaticDevice {
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
                frame: Frame::new(vec![1u8, 2, 3], 8, 8),
                method: CaptureMethod::Raw,
                elapsed: Duration::from_millis(5),
                failed: Vec::new(),
            })
        }
    }

    fn engine() -> CaptureEngine {
        let mut cfg = EngineConfig::default();
        cfg.scrcpy.enabled = false;
        CaptureEngine::new(Arc::new(StaticDevice), cfg)
    }

    #[tokio::test]
    async fn capture_without_session_is_unavailable() {
        let e = engine();
        assert!(matches!(
            e.capture().await,
            CaptureResult::Error(CaptureError::DeviceUnavailable(_))
        ));
        assert_eq!(e.latest(&PullRequest::default()).status, PullStatus::Unavailable);
        assert!(e.mjpeg().is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_discards_session() {
        let e = engine();
        e.start_streaming("dev").await.unwrap();
        let first = e.session().unwrap();
        e.start_streaming("dev").await.unwrap();
        assert!(Arc::ptr_eq(&first, &e.session().unwrap()));

        e.start_streaming("other").await.unwrap();
        assert!(!first.is_streaming());
        assert_eq!(e.device_id().as_deref(), Some("other"));

        e.stop_streaming().await;
        assert!(!e.is_streaming());
        assert!(e.snapshot().is_none());
        e.stop_streaming().await;
    }

    #[tokio::test]
    async fn invalid_settings_leave_current_untouched() {
        let e = engine();
        let before = e.settings();
        assert!(e
            .update_settings(SettingsUpdate {
                quality: Some(0),
                fps: Some(10.0),
                ..Default::default()
            })
            .is_err());
        assert_eq!(e.settings(), before);

        let after = e
            .update_settings(SettingsUpdate {
                max_width: Some(720),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(after.max_width, 720);
        assert_eq!(after.fps, before.fps);
    }

    #[tokio::test]
    async fn status_reports_session() {
        let e = engine();
        e.start_streaming("dev").await.unwrap();
        assert!(matches!(e.capture().await, CaptureResult::New(_) | CaptureResult::Unchanged));
        let st = e.status();
        assert!(st.streaming);
        assert_eq!(st.device_id.as_deref(), Some("dev"));
        assert!(st.last_frame_ms.is_some());
        assert_eq!(st.recommended_method, Some(CaptureMethod::Raw));
        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["capture"]["state"], "live");
        e.stop_streaming().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_bounded_by_join_timeout_with_stubborn_pipeline() {
        use crate::test_util::{fake_pipeline, script, temp_dir};

        let dir = temp_dir("engine-stop");
        let mut cfg = EngineConfig::default();
        cfg.stop_join_timeout_ms = 300;
        cfg.scrcpy = fake_pipeline(&dir, "exec sleep 30");
        // A producer that ignores SIGTERM would hold stop for the grace period.
        cfg.scrcpy.scrcpy_path = script(
            &dir,
            "scrcpy-stubborn",
            "[ \"$1\" = \"--version\" ] && exit 0\ntrap '' TERM\nexec sleep 30",
        );
        cfg.scrcpy.terminate_grace_ms = 10_000;
        let fifo_dir = cfg.scrcpy.fifo_dir();
        let e = CaptureEngine::new(Arc::new(StaticDevice), cfg);

        e.start_streaming("dev").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while std::fs::read_dir(&fifo_dir).unwrap().count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        e.stop_streaming().await;
        assert!(started.elapsed() < Duration::from_millis(1_500), "{:?}", started.elapsed());
        assert!(!e.is_streaming());
        assert_eq!(std::fs::read_dir(&fifo_dir).unwrap().count(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
