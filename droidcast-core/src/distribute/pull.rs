//! HTTP pull (`GET /stream/latest`) as a pure function of a snapshot.
//!
//! Decision order:
//!
//! 1. `423` the last attempt found the screen locked
//! 2. `503` the last attempt failed, or there is no frame at all
//! 3. `304` `If-None-Match` names the current content hash
//! 4. `204` no ETag sent, and `since` is not older than the last change
//! 5. `200` the JPEG, gzip-encoded if accepted and smaller

use bytes::Bytes;

use crate::cache::{CaptureStatus, Snapshot};
use crate::distribute::gzip_if_smaller;
use crate::types::{ContentHash, unix_ms};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequest {
    /// Raw `If-None-Match` header value.
    pub if_none_match: Option<String>,
    /// Client's last seen `X-Timestamp`, in Unix milliseconds.
    pub since_ms: Option<u64>,
    /// Whether `Accept-Encoding` allows gzip.
    pub accept_gzip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Ok,
    NoContent,
    NotModified,
    Locked,
    Unavailable,
}

impl PullStatus {
    pub fn code(self) -> u16 {
        match self {
            PullStatus::Ok => 200,
            PullStatus::NoContent => 204,
            PullStatus::NotModified => 304,
            PullStatus::Locked => 423,
            PullStatus::Unavailable => 503,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullResponse {
    pub status: PullStatus,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl PullResponse {
    fn empty(status: PullStatus) -> Self {
        Self {
            status,
            headers: vec![("Cache-Control", "no-cache".into())],
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Quoted entity tag for a content hash.
pub fn etag(hash: &ContentHash) -> String {
    format!("\"{}\"", hash.to_hex())
}

/// Does an `If-None-Match` value match `hash`? Handles lists, weak tags,
/// `*` and unquoted tags.
pub fn etag_matches(if_none_match: &str, hash: &ContentHash) -> bool {
    let hex = hash.to_hex();
    if_none_match.split(',').any(|tag| {
        let tag = tag.trim();
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag == "*" || tag.trim_matches('"') == hex
    })
}

/// Whether an `Accept-Encoding` value permits gzip.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|item| {
        let mut parts = item.split(';').map(str::trim);
        let coding = parts.next().unwrap_or_default();
        let refused = parts.any(|p| {
            p.strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });
        (coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
    })
}

pub fn respond(snapshot: &Snapshot, req: &PullRequest) -> PullResponse {
    match snapshot.status {
        CaptureStatus::Locked => return PullResponse::empty(PullStatus::Locked),
        CaptureStatus::Failed(_) => return PullResponse::empty(PullStatus::Unavailable),
        CaptureStatus::Pending | CaptureStatus::Live => {}
    }
    let Some(frame) = snapshot.frame.as_ref() else {
        return PullResponse::empty(PullStatus::Unavailable);
    };

    let tag = etag(&frame.content_hash());
    let timestamp = frame.timestamp_ms().to_string();

    if let Some(inm) = req.if_none_match.as_deref() {
        if etag_matches(inm, &frame.content_hash()) {
            let mut resp = PullResponse::empty(PullStatus::NotModified);
            resp.headers.push(("ETag", tag));
            resp.headers.push(("X-Timestamp", timestamp));
            return resp;
        }
    } else if let (Some(since), Some(changed)) = (req.since_ms, snapshot.changed_at) {
        if since >= unix_ms(changed) {
            let mut resp = PullResponse::empty(PullStatus::NoContent);
            resp.headers.push(("X-Timestamp", timestamp));
            return resp;
        }
    }

    let mut resp = PullResponse {
        status: PullStatus::Ok,
        headers: vec![
            ("Content-Type", "image/jpeg".into()),
            ("Cache-Control", "no-cache".into()),
            ("ETag", tag),
            ("X-Timestamp", timestamp),
        ],
        body: frame.pixels().clone(),
    };
    if req.accept_gzip {
        if let Some(packed) = gzip_if_smaller(frame.pixels()) {
            resp.body = Bytes::from(packed);
            resp.headers.push(("Content-Encoding", "gzip".into()));
            resp.headers.push(("Vary", "Accept-Encoding".into()));
        }
    }
    resp
}

// ── Tests ────────────────────────────────────────────────────────
