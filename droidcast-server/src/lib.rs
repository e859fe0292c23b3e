//! # droidcast-server
//!
//! Serves one [`CaptureEngine`](droidcast_core::CaptureEngine) over HTTP:
//! the pull endpoint, an MJPEG body, a WebSocket push feed and a small
//! JSON control surface.

pub mod config;
pub mod routes;
