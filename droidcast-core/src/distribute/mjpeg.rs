//! MJPEG over `multipart/x-mixed-replace`.
//!
//! The stream ticks at the current fps, reads the cache snapshot on each
//! tick and yields one part whenever the cached frame is newer than the
//! last one sent. It ends when the cache goes away (session stopped), when
//! the device is reported unavailable, or after `max_empty_reads`
//! consecutive ticks with nothing new.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use crate::cache::{CaptureStatus, Snapshot};
use crate::types::StreamSettings;

pub const BOUNDARY: &str = "frame";

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub type MjpegStream = BoxStream<'static, Bytes>;

/// One multipart part wrapping `jpeg`.
pub fn part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

struct Ticker {
    cache: watch::Receiver<Arc<Snapshot>>,
    settings: watch::Receiver<StreamSettings>,
    last_sent: Option<SystemTime>,
    empty_reads: u32,
    max_empty_reads: u32,
    first: bool,
}

impl Ticker {
    async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            if !self.first {
                let interval = self.settings.borrow().frame_interval();
                tokio::time::sleep(interval).await;
            }
            self.first = false;

            // Err once the cache's sender is gone.
            self.cache.has_changed().ok()?;
            let snap = self.cache.borrow_and_update().clone();
            if snap.status == CaptureStatus::Failed("device_unavailable") {
                return None;
            }
            match snap.frame.as_ref() {
                Some(f) if self.last_sent.is_none_or(|t| f.captured_at() > t) => {
                    self.last_sent = Some(f.captured_at());
                    self.empty_reads = 0;
                    return Some(part(f.pixels()));
                }
                _ => {
                    self.empty_reads += 1;
                    if self.empty_reads >= self.max_empty_reads {
                        return None;
                    }
                }
            }
        }
    }
}

/// Lazy MJPEG body over a session's cache.
pub fn mjpeg_stream(
    cache: watch::Receiver<Arc<Snapshot>>,
    settings: watch::Receiver<StreamSettings>,
    max_empty_reads: u32,
) -> MjpegStream {
    let ticker = Ticker {
        cache,
        settings,
        last_sent: None,
        empty_reads: 0,
        max_empty_reads: max_empty_reads.max(1),
        first: true,
    };
    stream::unfold(ticker, |mut t| async move {
        let part = t.next_part().await?;
        Some((part, t))
    })
    .boxed()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FrameCache;
    use crate::types::Frame;

    fn settings() -> (watch::Sender<StreamSettings>, watch::Receiver<StreamSettings>) {
        watch::channel(StreamSettings {
            fps: 100.0,
            ..Default::default()
        })
    }

    #[test]
    fn part_layout() {
        let p = part(b"JPEG");
        assert_eq!(
            &p[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn yields_new_frames_then_gives_up_when_idle() {
        let cache = FrameCache::new();
        cache.commit(Frame::new(vec![1u8, 2], 1, 1));
        let (_stx, srx) = settings();
        let mut s = mjpeg_stream(cache.subscribe(), srx, 3);

        let first = s.next().await.unwrap();
        assert!(first.ends_with(&[1u8, 2, b'\r', b'\n']));

        cache.commit(Frame::new(vec![3u8], 1, 1));
        let second = s.next().await.unwrap();
        assert!(second.ends_with(&[3u8, b'\r', b'\n']));

        // Nothing newer: three empty ticks end the stream.
        assert!(s.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_session_drops_cache() {
        let cache = FrameCache::new();
        let (_stx, srx) = settings();
        let mut s = mjpeg_stream(cache.subscribe(), srx, 1000);
        drop(cache);
        assert!(s.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_device_unavailable() {
        let cache = FrameCache::new();
        cache.commit(Frame::new(vec![1u8], 1, 1));
        let (_stx, srx) = settings();
        let mut s = mjpeg_stream(cache.subscribe(), srx, 1000);
        assert!(s.next().await.is_some());
        cache.mark_failed("device_unavailable");
        assert!(s.next().await.is_none());
    }
}
