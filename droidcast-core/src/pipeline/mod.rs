//! scrcpy producer + decoder subprocess pipeline.
//!
//! ```text
//!  scrcpy --record=<fifo> ──▶ FIFO ──▶ ffmpeg -i <fifo> ... -f image2pipe -
//!                                                    │ stdout (PNG stream)
//!                                                    ▼
//!                                      PngStreamReader (worker task)
//!                                                    │
//!                                                    ▼
//!                                      FrameQueue (cap 2, drop-oldest)
//! ```
//!
//! | Module       | Purpose                                          |
//! |--------------|--------------------------------------------------|
//! | `png_stream` | Incremental PNG deserializer for decoder stdout  |
//! | `queue`      | Bounded drop-oldest frame hand-off               |
//! | `fifo`       | Named pipe creation and guaranteed removal       |
//!
//! State machine:
//! `Idle → Starting → WaitingFirstFrame → Streaming → Stopped`. Any error
//! goes straight to `Stopped`, and `Stopped` always means both children are
//! gone and the FIFO is unlinked.

pub mod fifo;
pub mod png_stream;
pub mod queue;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScrcpyConfig;
use crate::error::CaptureError;
use fifo::NamedPipe;
use png_stream::{PngStreamReader, ScanLimits};
use queue::FrameQueue;

/// Lifecycle of a [`ProcessPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    WaitingFirstFrame,
    Streaming,
    Stopped,
}

/// Owns the producer/decoder pair, the FIFO between them and the worker
/// that deserializes decoded frames.
pub struct ProcessPipeline {
    device_id: String,
    config: ScrcpyConfig,
    state: PipelineState,
    producer: Option<Child>,
    decoder: Option<Child>,
    pipe: Option<NamedPipe>,
    queue: Arc<FrameQueue>,
    reader: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProcessPipeline {
    /// `cancel` aborts the first-frame wait and stops the reader worker.
    pub fn new(device_id: &str, config: ScrcpyConfig, cancel: CancellationToken) -> Self {
        let queue = Arc::new(FrameQueue::new(config.queue_depth));
        Self {
            device_id: device_id.to_string(),
            config,
            state: PipelineState::Idle,
            producer: None,
            decoder: None,
            pipe: None,
            queue,
            reader: None,
            cancel,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Bring the pipeline up and wait for its first frame.
    ///
    /// On any failure the pipeline is fully stopped before returning
    /// [`CaptureError::PipelineStartupFailure`].
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        if self.state != PipelineState::Idle {
            return Err(CaptureError::PipelineStartupFailure(format!(
                "pipeline already {:?}",
                self.state
            )));
        }
        match self.try_start().await {
            Ok(()) => {
                self.state = PipelineState::Streaming;
                info!(device_id = %self.device_id, "scrcpy pipeline streaming");
                Ok(())
            }
            Err(e) => {
                self.stop().await;
                Err(match e {
                    CaptureError::PipelineStartupFailure(_) => e,
                    other => CaptureError::PipelineStartupFailure(other.to_string()),
                })
            }
        }
    }

    async fn try_start(&mut self) -> Result<(), CaptureError> {
        self.state = PipelineState::Starting;
        let pipe = NamedPipe::create(&self.config.fifo_dir(), &self.device_id)?;
        let fifo = pipe.path().to_string_lossy().into_owned();
        self.pipe = Some(pipe);

        let producer = spawn(
            Command::new(&self.config.scrcpy_path)
                .arg(format!("--serial={}", self.device_id))
                .arg(format!("--max-size={}", self.config.max_size))
                .arg(format!("--video-bit-rate={}", self.config.bit_rate))
                .arg(format!("--max-fps={}", self.config.max_fps))
                .args(["--no-window", "--no-control", "--no-audio"])
                .arg(format!("--record={fifo}"))
                .arg("--record-format=mkv")
                .stdout(Stdio::null()),
            "producer",
        )?;
        self.producer = Some(producer);

        let mut decoder = spawn(
            Command::new(&self.config.decoder_path)
                .args(["-loglevel", "error", "-f", "matroska", "-i"])
                .arg(&fifo)
                .arg("-vf")
                .arg(format!("fps={}", self.config.max_fps))
                .args(["-f", "image2pipe", "-vcodec", "png", "-"])
                .stdout(Stdio::piped()),
            "decoder",
        )?;
        let stdout = decoder.stdout.take().ok_or_else(|| {
            CaptureError::PipelineStartupFailure("decoder stdout unavailable".into())
        })?;
        self.decoder = Some(decoder);

        self.reader = Some(tokio::spawn(read_frames(
            PngStreamReader::new(
                stdout,
                ScanLimits::from(&self.config),
                self.config.poll_interval(),
                self.config.max_idle_polls,
            ),
            self.queue.clone(),
            self.cancel.clone(),
        )));

        self.state = PipelineState::WaitingFirstFrame;
        self.wait_first_frame().await
    }

    async fn wait_first_frame(&mut self) -> Result<(), CaptureError> {
        let timeout = self.config.first_frame_timeout();
        let deadline = Instant::now() + timeout;
        let tick = self.config.poll_interval().max(Duration::from_millis(10));
        loop {
            let ready = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CaptureError::PipelineStartupFailure("cancelled".into()));
                }
                r = self.queue.wait_ready(tick) => r?,
            };
            if ready {
                return Ok(());
            }
            if let Some(status) = self.exited_child() {
                return Err(CaptureError::PipelineStartupFailure(status));
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::PipelineStartupFailure(format!(
                    "no frame within {timeout:?}"
                )));
            }
        }
    }

    /// Wait up to `timeout` for the next decoded PNG.
    ///
    /// [`CaptureError::NoFrameYet`] if nothing arrived in time,
    /// [`CaptureError::ProcessExited`] once the decoder stream has ended.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<Bytes, CaptureError> {
        if self.state != PipelineState::Streaming {
            return Err(CaptureError::ProcessExited(format!(
                "pipeline is {:?}",
                self.state
            )));
        }
        if let Some(status) = self.exited_child() {
            // Frames already decoded are still good.
            if let Some(frame) = self.queue.try_pop()? {
                return Ok(frame);
            }
            return Err(CaptureError::ProcessExited(status));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CaptureError::NoFrameYet),
            r = self.queue.pop(timeout) => r?.ok_or(CaptureError::NoFrameYet),
        }
    }

    /// Description of the first child found to have exited, if any.
    fn exited_child(&mut self) -> Option<String> {
        for (name, child) in [("producer", &mut self.producer), ("decoder", &mut self.decoder)] {
            if let Some(c) = child.as_mut() {
                if let Ok(Some(status)) = c.try_wait() {
                    return Some(format!("{name} exited with {status}"));
                }
            }
        }
        None
    }

    /// Terminate both children and unlink the FIFO. Idempotent.
    pub async fn stop(&mut self) {
        if self.state != PipelineState::Stopped {
            debug!(device_id = %self.device_id, state = ?self.state, "stopping scrcpy pipeline");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        let grace = self.config.terminate_grace();
        let producer = self.producer.take();
        let decoder = self.decoder.take();
        tokio::join!(
            terminate(producer, grace, "producer"),
            terminate(decoder, grace, "decoder")
        );
        if let Some(mut pipe) = self.pipe.take() {
            if let Err(e) = pipe.remove() {
                warn!(path = %pipe.path().display(), error = %e, "failed to remove pipe");
            }
        }
        self.queue.close("pipeline stopped");
        self.state = PipelineState::Stopped;
    }
}

impl Drop for ProcessPipeline {
    fn drop(&mut self) {
        // Children are `kill_on_drop` and the pipe unlinks itself; only the
        // worker needs an explicit nudge.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn spawn(cmd: &mut Command, role: &str) -> Result<Child, CaptureError> {
    let program = cmd.as_std().get_program().to_os_string();
    cmd.stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CaptureError::PipelineStartupFailure(format!("{role} {program:?} failed to spawn: {e}"))
        })
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: Option<Child>, grace: Duration, role: &str) {
    let Some(mut child) = child else {
        return;
    };
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        debug!(role, "grace period elapsed, killing");
        if let Err(e) = child.kill().await {
            warn!(role, error = %e, "kill failed");
        }
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: PngStreamReader<R>,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                queue.close("cancelled");
                return;
            }
            r = reader.next_frame() => r,
        };
        match next {
            Ok(Some(frame)) => {
                if queue.push(frame) {
                    debug!("frame queue full, dropped oldest");
                }
            }
            Ok(None) => {}
            Err(e @ CaptureError::ProtocolParse(_)) => {
                // Malformed bytes were discarded; resync on the next frame.
                debug!(error = %e, "decoder stream out of sync");
            }
            Err(e) => {
                queue.close(e.to_string());
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
