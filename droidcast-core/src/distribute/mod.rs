//! Consumer protocols over the frame cache.
//!
//! | Module  | Consumer style                                          |
//! |---------|---------------------------------------------------------|
//! | `pull`  | HTTP long-poll with ETag / `X-Timestamp` validation     |
//! | `push`  | WebSocket fan-out with keepalive                        |
//! | `mjpeg` | `multipart/x-mixed-replace` stream paced at the fps     |
//!
//! None of them ever triggers a capture; they only read snapshots.

pub mod mjpeg;
pub mod pull;
pub mod push;

pub use mjpeg::{MjpegStream, mjpeg_stream};
pub use pull::{PullRequest, PullResponse, PullStatus, respond};
pub use push::{Incoming, Outgoing, PushHub, SubscriberId, serve_subscriber};

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Gzip `data`, returning `None` when that would not make it smaller.
///
/// JPEG rarely shrinks, so most calls end up `None`.
pub fn gzip_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len()), Compression::fast());
    enc.write_all(data).ok()?;
    let out = enc.finish().ok()?;
    (out.len() < data.len()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_only_when_smaller() {
        let text = vec![b'a'; 4096];
        let packed = gzip_if_smaller(&text).unwrap();
        assert!(packed.len() < text.len());
        assert!(gzip_if_smaller(b"xy").is_none());
    }
}
