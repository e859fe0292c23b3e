//! WebSocket push.
//!
//! [`PushHub`] is the subscriber registry: the capture path calls
//! [`broadcast`](PushHub::broadcast) after every successful capture, and
//! each connection runs [`serve_subscriber`] to move queued messages onto
//! its socket. The socket itself stays behind `Sink`/`Stream` so this
//! module never depends on a particular WebSocket library.
//!
//! Wire message:
//!
//! ```json
//! {"type":"frame","data":"<base64 jpeg>","compressed":false,"timestamp":1718000000000}
//! ```
//!
//! `compressed` means `data` is gzip(jpeg). Clients may send `"ping"` and
//! get `"pong"`; a connection with no traffic for [`KEEPALIVE_IDLE`] gets a
//! protocol-level ping.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::distribute::gzip_if_smaller;
use crate::types::Frame;

/// Silence after which the server pings.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct FrameMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    data: String,
    compressed: bool,
    timestamp: u64,
}

/// Serialize `frame` into the wire message.
pub fn frame_message(frame: &Frame) -> String {
    let (payload, compressed) = match gzip_if_smaller(frame.pixels()) {
        Some(packed) => (STANDARD.encode(packed), true),
        None => (STANDARD.encode(frame.pixels()), false),
    };
    let msg = FrameMessage {
        kind: "frame",
        data: payload,
        compressed,
        timestamp: frame.timestamp_ms(),
    };
    // Serializing a struct of strings, bools and integers cannot fail.
    serde_json::to_string(&msg).unwrap_or_default()
}

// ── PushHub ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub struct PushHub {
    next_id: AtomicU64,
    buffer: usize,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
}

impl PushHub {
    /// `buffer` is the number of messages queued per subscriber.
    pub fn new(buffer: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, tx);
        }
        debug!(?id, "push subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut subs) = self.subscribers.lock() {
            if subs.remove(&id).is_some() {
                debug!(?id, "push subscriber removed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber; their connection loops then exit.
    pub fn disconnect_all(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    /// Queue `frame` for every subscriber. Returns how many accepted it.
    ///
    /// A subscriber whose connection is gone is removed. One whose queue is
    /// full skips this frame and keeps its place.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<Arc<str>>)> = match self.subscribers.lock() {
            Ok(subs) if !subs.is_empty() => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            _ => return 0,
        };

        let msg: Arc<str> = Arc::from(frame_message(frame));
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(?id, "push subscriber lagging, frame skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            if let Ok(mut subs) = self.subscribers.lock() {
                for id in gone {
                    subs.remove(&id);
                }
            }
        }
        delivered
    }
}

// ── Connection loop ──────────────────────────────────────────────

/// What the connection loop writes to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(Arc<str>),
    Ping,
}

/// What the socket delivered, reduced to what the loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// Any other frame (binary, ping, pong); counts as activity.
    Activity,
    Close,
}

/// Drive one subscriber until either side goes away.
///
/// Registers with `hub` on entry and always unregisters on exit.
pub async fn serve_subscriber<Tx, Rx>(hub: &PushHub, mut sink: Tx, mut incoming: Rx, idle: Duration)
where
    Tx: Sink<Outgoing> + Unpin,
    Rx: Stream<Item = Incoming> + Unpin,
{
    let (id, mut frames) = hub.subscribe();
    let mut last_activity = Instant::now();
    loop {
        let out = tokio::select! {
            msg = frames.recv() => match msg {
                Some(text) => Outgoing::Text(text),
                None => break,
            },
            inc = incoming.next() => match inc {
                Some(Incoming::Text(t)) if t.trim() == "ping" => Outgoing::Text(Arc::from("pong")),
                Some(Incoming::Text(_)) | Some(Incoming::Activity) => {
                    last_activity = Instant::now();
                    continue;
                }
                Some(Incoming::Close) | None => break,
            },
            _ = tokio::time::sleep_until(last_activity + idle) => Outgoing::Ping,
        };
        if sink.send(out).await.is_err() {
            break;
        }
        last_activity = Instant::now();
    }
    hub.unsubscribe(id);
}

// ── Tests ────────────────────────────────────────────────────────
