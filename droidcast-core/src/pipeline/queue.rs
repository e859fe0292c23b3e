//! Bounded hand-off between the deserializer worker and the capture path.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::CaptureError;

#[derive(Default)]
struct Inner {
    frames: VecDeque<Bytes>,
    closed: Option<String>,
    dropped: u64,
}

/// Drop-oldest queue of decoded images.
///
/// Once closed, queued frames are still handed out; after that every pop
/// reports the close reason as [`CaptureError::ProcessExited`].
pub struct FrameQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue `frame`, evicting the oldest one when full. Returns whether
    /// a frame was evicted.
    pub fn push(&self, frame: Bytes) -> bool {
        let evicted = {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            let evicted = inner.frames.len() >= self.capacity;
            if evicted {
                inner.frames.pop_front();
                inner.dropped += 1;
            }
            inner.frames.push_back(frame);
            evicted
        };
        self.notify.notify_waiters();
        evicted
    }

    pub fn try_pop(&self) -> Result<Option<Bytes>, CaptureError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(CaptureError::ProcessExited("frame queue poisoned".into()));
        };
        match inner.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => match &inner.closed {
                Some(reason) => Err(CaptureError::ProcessExited(reason.clone())),
                None => Ok(None),
            },
        }
    }

    /// Wait up to `timeout` for a frame; `Ok(None)` if none arrived.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<Bytes>, CaptureError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();
            if let Some(frame) = self.try_pop()? {
                return Ok(Some(frame));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Wait up to `timeout` until at least one frame is queued, without
    /// consuming it.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() > 0 {
                return Ok(true);
            }
            if let Some(reason) = self.closed_reason() {
                return Err(CaptureError::ProcessExited(reason));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.len() > 0);
            }
        }
    }

    /// Mark the producer side finished. The first reason wins.
    pub fn close(&self, reason: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.closed.is_none() {
                inner.closed = Some(reason.into());
            }
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().map(|i| i.dropped).unwrap_or(0)
    }

    fn closed_reason(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|i| i.closed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drops_oldest_when_full() {
        let q = FrameQueue::new(2);
        assert!(!q.push(Bytes::from_static(b"1")));
        assert!(!q.push(Bytes::from_static(b"2")));
        assert!(q.push(Bytes::from_static(b"3")));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_pop().unwrap().unwrap(), Bytes::from_static(b"2"));
        assert_eq!(q.try_pop().unwrap().unwrap(), Bytes::from_static(b"3"));
        assert!(q.try_pop().unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(FrameQueue::new(2));
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(Bytes::from_static(b"late"));
        });
        let got = q.pop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let q = FrameQueue::new(2);
        assert!(q.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_drains_then_errors() {
        let q = FrameQueue::new(2);
        q.push(Bytes::from_static(b"last"));
        q.close("decoder exited");
        q.close("ignored");
        assert!(q.pop(Duration::from_millis(10)).await.unwrap().is_some());
        match q.pop(Duration::from_millis(10)).await {
            Err(CaptureError::ProcessExited(reason)) => assert_eq!(reason, "decoder exited"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(q.wait_ready(Duration::from_millis(10)).await.is_err());
    }
}
