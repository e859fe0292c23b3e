//! HTTP and WebSocket routes over a shared [`CaptureEngine`].
//!
//! ```text
//! GET  /stream/latest    pull, ETag / X-Timestamp validated
//! GET  /stream/mjpeg     multipart/x-mixed-replace body
//! GET  /stream/ws        push subscriber
//! GET  /stream/status    engine status JSON
//! POST /stream/settings  {quality?, max_width?, fps?}
//! POST /stream/start     {device_id}
//! POST /stream/stop
//! POST /stream/capture   one capture now
//! ```
//!
//! Handlers only translate between HTTP and the engine's types.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use droidcast_core::distribute::mjpeg;
use droidcast_core::distribute::pull::accepts_gzip;
use droidcast_core::distribute::push::{Incoming, KEEPALIVE_IDLE, Outgoing, serve_subscriber};
use droidcast_core::{CaptureEngine, CaptureResult, PullRequest, PullResponse, SettingsUpdate};

pub type AppState = Arc<CaptureEngine>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/stream/latest", get(latest))
        .route("/stream/mjpeg", get(mjpeg_body))
        .route("/stream/ws", get(ws_upgrade))
        .route("/stream/status", get(status))
        .route("/stream/settings", post(update_settings))
        .route("/stream/start", post(start))
        .route("/stream/stop", post(stop))
        .route("/stream/capture", post(capture))
        .with_state(engine)
}

fn error_json(code: StatusCode, msg: impl std::fmt::Display) -> Response {
    (code, Json(json!({ "error": msg.to_string() }))).into_response()
}

// ── Pull ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct LatestQuery {
    since: Option<u64>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn latest(
    State(engine): State<AppState>,
    Query(q): Query<LatestQuery>,
    headers: HeaderMap,
) -> Response {
    let req = PullRequest {
        if_none_match: header_str(&headers, header::IF_NONE_MATCH).map(str::to_string),
        since_ms: q.since,
        accept_gzip: header_str(&headers, header::ACCEPT_ENCODING).is_some_and(accepts_gzip),
    };
    pull_response(engine.latest(&req))
}

fn pull_response(resp: PullResponse) -> Response {
    let mut builder = Response::builder().status(resp.status.code());
    for (name, value) in &resp.headers {
        builder = builder.header(*name, value.as_str());
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|e| error_json(StatusCode::INTERNAL_SERVER_ERROR, e))
}

// ── MJPEG ────────────────────────────────────────────────────────

async fn mjpeg_body(State(engine): State<AppState>) -> Response {
    let Some(stream) = engine.mjpeg() else {
        return error_json(StatusCode::SERVICE_UNAVAILABLE, "not streaming");
    };
    Response::builder()
        .header(header::CONTENT_TYPE, mjpeg::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .unwrap_or_else(|e| error_json(StatusCode::INTERNAL_SERVER_ERROR, e))
}

// ── Push ─────────────────────────────────────────────────────────

async fn ws_upgrade(State(engine): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| push_connection(engine, socket))
}

async fn push_connection(engine: AppState, socket: WebSocket) {
    let hub = engine.push_hub();
    let (sender, receiver) = socket.split();
    info!(subscribers = hub.len() + 1, "push client connected");

    let sink = sender.with(|out: Outgoing| async move {
        Ok::<_, axum::Error>(match out {
            Outgoing::Text(text) => Message::Text(text.to_string()),
            Outgoing::Ping => Message::Ping(Vec::new()),
        })
    });
    let incoming = receiver.map(|msg| match msg {
        Ok(Message::Text(text)) => Incoming::Text(text),
        Ok(Message::Close(_)) => Incoming::Close,
        Ok(_) => Incoming::Activity,
        Err(e) => {
            debug!(error = %e, "push socket error");
            Incoming::Close
        }
    });

    serve_subscriber(&hub, Box::pin(sink), Box::pin(incoming), KEEPALIVE_IDLE).await;
    info!(subscribers = hub.len(), "push client disconnected");
}

// ── Control ──────────────────────────────────────────────────────

async fn status(State(engine): State<AppState>) -> Response {
    Json(engine.status()).into_response()
}

async fn update_settings(
    State(engine): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    match engine.update_settings(update) {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_json(StatusCode::BAD_REQUEST, e),
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    device_id: String,
}

async fn start(State(engine): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    match engine.start_streaming(&req.device_id).await {
        Ok(()) => Json(engine.status()).into_response(),
        Err(e) => error_json(StatusCode::BAD_REQUEST, e),
    }
}

async fn stop(State(engine): State<AppState>) -> Response {
    engine.stop_streaming().await;
    Json(engine.status()).into_response()
}

async fn capture(State(engine): State<AppState>) -> Response {
    let body = match engine.capture().await {
        CaptureResult::New(frame) => json!({
            "result": "new",
            "timestamp": frame.timestamp_ms(),
            "width": frame.width(),
            "height": frame.height(),
        }),
        CaptureResult::Unchanged => json!({ "result": "unchanged" }),
        CaptureResult::Locked => json!({ "result": "locked" }),
        CaptureResult::Error(e) => json!({ "result": "error", "kind": e.kind(), "error": e.to_string() }),
    };
    Json(body).into_response()
}

// ── Tests ────────────────────────────────────────────────────────
