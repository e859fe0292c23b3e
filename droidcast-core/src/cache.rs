//! Latest-frame cache with change detection.
//!
//! The cache publishes immutable [`Snapshot`]s through a `watch` channel:
//! writers swap in a new `Arc<Snapshot>` under the channel's write lock,
//! and readers clone the `Arc` and drop the lock before doing any I/O.
//! Only the capture path writes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;

use crate::types::{CaptureResult, Frame};

/// Outcome of the most recent capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum CaptureStatus {
    /// Nothing attempted yet.
    Pending,
    /// The last attempt produced a frame (new or unchanged).
    Live,
    /// The last attempt found the screen locked.
    Locked,
    /// The last attempt failed; carries the error kind.
    Failed(&'static str),
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Last successfully captured frame. Never cleared by a failure.
    pub frame: Option<Frame>,
    pub status: CaptureStatus,
    /// When the frame content last changed.
    pub changed_at: Option<SystemTime>,
    /// Bumped on every write.
    pub seq: u64,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            frame: None,
            status: CaptureStatus::Pending,
            changed_at: None,
            seq: 0,
        }
    }
}

pub struct FrameCache {
    tx: watch::Sender<Arc<Snapshot>>,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::empty()));
        Self { tx }
    }

    /// Store `frame` if its content differs from the cached frame.
    ///
    /// Identical content returns [`CaptureResult::Unchanged`] but still
    /// re-stamps the cached frame. Stored timestamps strictly increase.
    pub fn commit(&self, frame: Frame) -> CaptureResult {
        let mut result = CaptureResult::Unchanged;
        self.tx.send_modify(|snap| {
            let prev_at = snap.frame.as_ref().map(Frame::captured_at);
            let at = monotonic(frame.captured_at(), prev_at);
            let next = match &snap.frame {
                Some(prev) if prev.content_hash() == frame.content_hash() => Snapshot {
                    frame: Some(prev.restamped(at)),
                    status: CaptureStatus::Live,
                    changed_at: snap.changed_at,
                    seq: snap.seq + 1,
                },
                _ => {
                    let stored = frame.restamped(at);
                    result = CaptureResult::New(stored.clone());
                    Snapshot {
                        frame: Some(stored),
                        status: CaptureStatus::Live,
                        changed_at: Some(at),
                        seq: snap.seq + 1,
                    }
                }
            };
            *snap = Arc::new(next);
        });
        result
    }

    pub fn mark_locked(&self) {
        self.set_status(CaptureStatus::Locked);
    }

    pub fn mark_failed(&self, kind: &'static str) {
        self.set_status(CaptureStatus::Failed(kind));
    }

    fn set_status(&self, status: CaptureStatus) {
        self.tx.send_modify(|snap| {
            let mut next = Snapshot::clone(&**snap);
            next.status = status;
            next.seq += 1;
            *snap = Arc::new(next);
        });
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().frame.clone()
    }

    /// Change feed. Ends when the cache is dropped.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

fn monotonic(now: SystemTime, prev: Option<SystemTime>) -> SystemTime {
    match prev {
        Some(p) if now <= p => p + Duration::from_micros(1),
        _ => now,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_is_unchanged_but_restamped() {
        let cache = FrameCache::new();
        let first = match cache.commit(Frame::new(vec![1u8, 2, 3], 4, 4)) {
            CaptureResult::New(f) => f,
            other => panic!("expected New, got {other:?}"),
        };
        assert!(matches!(
            cache.commit(Frame::new(vec![1u8, 2, 3], 4, 4)),
            CaptureResult::Unchanged
        ));
        let snap = cache.snapshot();
        let cached = snap.frame.as_ref().unwrap();
        assert_eq!(cached.content_hash(), first.content_hash());
        assert!(cached.captured_at() > first.captured_at());
        assert_eq!(snap.changed_at, Some(first.captured_at()));
        assert_eq!(snap.seq, 2);
    }

    #[test]
    fn different_content_replaces() {
        let cache = FrameCache::new();
        cache.commit(Frame::new(vec![1u8], 1, 1));
        assert!(matches!(cache.commit(Frame::new(vec![2u8], 1, 1)), CaptureResult::New(_)));
        assert_eq!(cache.latest().unwrap().pixels().as_ref(), &[2u8]);
    }

    #[test]
    fn failures_keep_the_frame() {
        let cache = FrameCache::new();
        cache.commit(Frame::new(vec![9u8], 1, 1));
        cache.mark_locked();
        assert_eq!(cache.snapshot().status, CaptureStatus::Locked);
        cache.mark_failed("capture_timeout");
        let snap = cache.snapshot();
        assert_eq!(snap.status, CaptureStatus::Failed("capture_timeout"));
        assert!(snap.frame.is_some());
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let cache = FrameCache::new();
        let f = Frame::new(vec![1u8], 1, 1);
        let older = f.restamped(f.captured_at() - Duration::from_secs(10));
        cache.commit(f.clone());
        cache.commit(Frame::new(vec![2u8], 1, 1).restamped(older.captured_at()));
        assert!(cache.latest().unwrap().captured_at() > f.captured_at());
    }

    #[tokio::test]
    async fn subscribers_see_writes_and_close() {
        let cache = FrameCache::new();
        let mut rx = cache.subscribe();
        cache.commit(Frame::new(vec![7u8], 1, 1));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().frame.is_some());
        drop(cache);
        assert!(rx.changed().await.is_err());
    }
}
