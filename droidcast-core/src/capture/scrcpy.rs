//! Frames from the scrcpy pipeline.
//!
//! One `ScrcpyStrategy` lives for one streaming session. It probes for the
//! scrcpy binary once at session start, owns at most one
//! [`ProcessPipeline`], and restarts it after a mid-stream exit until the
//! restart budget runs out. A failed probe, a failed startup or an
//! exhausted budget disables scrcpy for the rest of the session and is
//! warned about exactly once.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureStrategy;
use crate::capture::encode::encode_encoded;
use crate::config::ScrcpyConfig;
use crate::error::CaptureError;
use crate::pipeline::{PipelineState, ProcessPipeline};
use crate::types::{CaptureMethod, CaptureParams, Frame};

/// Bound on `scrcpy --version`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

struct State {
    /// `None` until probed; only ever probed once per session.
    available: Option<bool>,
    /// Set once scrcpy is given up on for this session.
    disabled: bool,
    pipeline: Option<ProcessPipeline>,
    starts: u32,
}

pub struct ScrcpyStrategy {
    config: ScrcpyConfig,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl ScrcpyStrategy {
    /// `cancel` is the session's stop signal.
    pub fn new(config: ScrcpyConfig, cancel: CancellationToken) -> Self {
        let disabled = !config.enabled;
        Self {
            config,
            cancel,
            state: Mutex::new(State {
                available: None,
                disabled,
                pipeline: None,
                starts: 0,
            }),
        }
    }

    /// Whether scrcpy should be tried this iteration.
    pub async fn is_available(&self) -> bool {
        let mut st = self.state.lock().await;
        if st.disabled {
            return false;
        }
        if st.available.is_none() {
            let found = probe(&self.config).await;
            if !found {
                warn!(
                    path = %self.config.scrcpy_path.display(),
                    "scrcpy not available, using adb capture for this session"
                );
                st.disabled = true;
            }
            st.available = Some(found);
        }
        !st.disabled
    }

    /// Stop the pipeline, if one is running.
    pub async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        if let Some(mut p) = st.pipeline.take() {
            p.stop().await;
        }
    }

    /// Pipeline state, `None` if no pipeline exists.
    pub async fn pipeline_state(&self) -> Option<PipelineState> {
        self.state.lock().await.pipeline.as_ref().map(|p| p.state())
    }
}

async fn probe(config: &ScrcpyConfig) -> bool {
    let child = Command::new(&config.scrcpy_path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let Ok(mut child) = child else {
        return false;
    };
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await,
        Ok(Ok(status)) if status.success()
    )
}

#[async_trait]
impl CaptureStrategy for ScrcpyStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Scrcpy
    }

    async fn capture(&self, device_id: &str, params: &CaptureParams) -> Result<Frame, CaptureError> {
        let mut st = self.state.lock().await;
        if st.disabled {
            return Err(CaptureError::PipelineStartupFailure(
                "scrcpy disabled for this session".into(),
            ));
        }

        if st.pipeline.is_none() {
            if st.starts > self.config.max_restarts {
                st.disabled = true;
                warn!(
                    device_id,
                    restarts = self.config.max_restarts,
                    "scrcpy pipeline keeps exiting, using adb capture for this session"
                );
                return Err(CaptureError::PipelineStartupFailure(
                    "restart budget exhausted".into(),
                ));
            }
            st.starts += 1;
            let mut pipeline =
                ProcessPipeline::new(device_id, self.config.clone(), self.cancel.child_token());
            if let Err(e) = pipeline.start().await {
                st.disabled = true;
                warn!(device_id, error = %e, "scrcpy pipeline failed to start, using adb capture");
                return Err(e);
            }
            if st.starts > 1 {
                info!(device_id, attempt = st.starts, "scrcpy pipeline restarted");
            }
            st.pipeline = Some(pipeline);
        }

        let Some(pipeline) = st.pipeline.as_mut() else {
            return Err(CaptureError::NoFrameYet);
        };
        let wait = self.config.frame_poll().min(params.timeout);
        match pipeline.next_frame(wait).await {
            Ok(png) => {
                drop(st);
                encode_encoded(png.to_vec(), *params).await
            }
            Err(e @ CaptureError::ProcessExited(_)) => {
                debug!(device_id, error = %e, "scrcpy pipeline exited");
                pipeline.stop().await;
                st.pipeline = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn missing() -> ScrcpyConfig {
        ScrcpyConfig {
            scrcpy_path: PathBuf::from("/nonexistent/droidcast-scrcpy"),
            ..ScrcpyConfig::default()
        }
    }

    #[tokio::test]
    async fn negative_probe_is_cached() {
        let s = ScrcpyStrategy::new(missing(), CancellationToken::new());
        assert!(!s.is_available().await);
        assert_eq!(s.state.lock().await.available, Some(false));
        assert!(!s.is_available().await);
    }

    #[tokio::test]
    async fn disabled_by_config() {
        let s = ScrcpyStrategy::new(
            ScrcpyConfig {
                enabled: false,
                ..ScrcpyConfig::default()
            },
            CancellationToken::new(),
        );
        assert!(!s.is_available().await);
        let params = CaptureParams {
            quality: 50,
            max_width: 540,
            timeout: Duration::from_millis(50),
        };
        assert!(matches!(
            s.capture("dev", &params).await,
            Err(CaptureError::PipelineStartupFailure(_))
        ));
        assert!(s.pipeline_state().await.is_none());
    }

    #[cfg(unix)]
    fn params(timeout: Duration) -> CaptureParams {
        CaptureParams {
            quality: 50,
            max_width: 540,
            timeout,
        }
    }

    /// Capture until the pipeline reports its decoder gone.
    #[cfg(unix)]
    async fn capture_until_exit(s: &ScrcpyStrategy) -> CaptureError {
        let p = params(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match s.capture("dev", &p).await {
                    Err(CaptureError::NoFrameYet) => continue,
                    Err(e) => return e,
                    Ok(_) => panic!("fake decoder writes a single frame"),
                }
            }
        })
        .await
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_pipeline_yields_no_frame_after_frame_poll() {
        use crate::test_util::{fake_pipeline, temp_dir};
        use std::time::Instant;

        let dir = temp_dir("scrcpy-idle");
        let cfg = ScrcpyConfig {
            frame_poll_ms: 20,
            ..fake_pipeline(&dir, "exec sleep 30")
        };
        let fifo_dir = cfg.fifo_dir();
        let s = ScrcpyStrategy::new(cfg, CancellationToken::new());
        assert!(s.is_available().await);

        let frame = s.capture("dev", &params(Duration::from_secs(3))).await.unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 4));
        assert_eq!(s.pipeline_state().await, Some(PipelineState::Streaming));

        // A static screen must not hold the capture for the whole timeout.
        let started = Instant::now();
        let err = s.capture("dev", &params(Duration::from_secs(3))).await.unwrap_err();
        assert!(matches!(err, CaptureError::NoFrameYet));
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());

        s.shutdown().await;
        assert!(s.pipeline_state().await.is_none());
        assert_eq!(std::fs::read_dir(&fifo_dir).unwrap().count(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_pipeline_restarts_until_budget_runs_out() {
        use crate::test_util::{fake_pipeline, temp_dir};

        let dir = temp_dir("scrcpy-restart");
        let cfg = ScrcpyConfig {
            frame_poll_ms: 20,
            max_restarts: 1,
            ..fake_pipeline(&dir, "sleep 0.3")
        };
        let fifo_dir = cfg.fifo_dir();
        let s = ScrcpyStrategy::new(cfg, CancellationToken::new());
        assert!(s.is_available().await);

        assert!(s.capture("dev", &params(Duration::from_secs(1))).await.is_ok());
        assert!(matches!(capture_until_exit(&s).await, CaptureError::ProcessExited(_)));
        assert!(s.pipeline_state().await.is_none());
        assert_eq!(std::fs::read_dir(&fifo_dir).unwrap().count(), 0);

        // One restart is allowed.
        assert!(s.capture("dev", &params(Duration::from_secs(1))).await.is_ok());
        assert_eq!(s.state.lock().await.starts, 2);
        assert!(matches!(capture_until_exit(&s).await, CaptureError::ProcessExited(_)));

        let err = s.capture("dev", &params(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, CaptureError::PipelineStartupFailure(_)));
        assert!(!s.is_available().await);
        assert_eq!(s.state.lock().await.starts, 2);
        assert_eq!(std::fs::read_dir(&fifo_dir).unwrap().count(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
