//! # droidcast-core
//!
//! Adaptive screen-capture and streaming engine for Android devices.
//!
//! ## Architecture
//!
//! ```text
//! DeviceStateCache ─┐
//! CaptureStrategy ──┼──▶ MethodSelector (timings)
//! ProcessPipeline ──┘          │
//!        │ frames              ▼
//!        └──────────────▶ capture loop ──▶ FrameCache ──▶ pull / push / mjpeg
//! ```
//!
//! ## Modules
//!
//! | Module       | Purpose                                                |
//! |--------------|--------------------------------------------------------|
//! | `types`      | `Frame`, `CaptureResult`, `StreamSettings`, methods     |
//! | `error`      | `CaptureError` and its retry classification             |
//! | `config`     | `EngineConfig` / `ScrcpyConfig` tunables                |
//! | `device`     | `DeviceFactory` boundary and `DeviceStateCache`          |
//! | `adb`        | `adb` command runner and the stock `AdbDevice`          |
//! | `capture`    | Raw, gzip, PNG, legacy-pull and scrcpy strategies       |
//! | `pipeline`   | scrcpy + decoder subprocess pipeline, PNG deserializer  |
//! | `selector`   | Latency ranking of ADB capture methods                  |
//! | `cache`      | Latest frame, change detection, snapshot publishing     |
//! | `listener`   | Screen-change listeners                                 |
//! | `session`    | Per-device session state and the capture loop           |
//! | `engine`     | `CaptureEngine`, the public control surface             |
//! | `distribute` | HTTP pull, WebSocket push and MJPEG consumers            |

pub mod adb;
pub mod cache;
pub mod capture;
pub mod config;
pub mod device;
pub mod distribute;
pub mod engine;
pub mod error;
pub mod listener;
pub mod pipeline;
pub mod selector;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use adb::{AdbDevice, AdbRunner, CommandRunner};
pub use cache::{CaptureStatus, FrameCache, Snapshot};
pub use capture::CaptureStrategy;
pub use config::{EngineConfig, ScrcpyConfig};
pub use device::{DeviceFactory, DeviceStateCache};
pub use distribute::{PullRequest, PullResponse, PullStatus, PushHub};
pub use engine::{CaptureEngine, EngineStatus};
pub use error::{CaptureError, ErrorClass};
pub use listener::{ChangeListener, ListenerId};
pub use pipeline::{PipelineState, ProcessPipeline};
pub use selector::MethodSelector;
pub use types::{
    CaptureMethod, CaptureParams, CaptureResult, CapturedFrame, ContentHash, Frame,
    SettingsUpdate, StreamSettings,
};
