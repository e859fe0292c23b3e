//! Scripted device plumbing shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use image::{ImageEncoder, RgbaImage, codecs::png::PngEncoder};

use crate::adb::CommandRunner;
use crate::config::ScrcpyConfig;
use crate::error::CaptureError;

#[derive(Debug, Clone)]
pub enum Reply {
    Bytes(Vec<u8>),
    Unavailable,
    Fail(&'static str),
    Hang,
}

/// Answers commands by their space-joined argument list.
///
/// The last reply queued for a command repeats forever.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, command: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        _device_id: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let key = args.join(" ");
        self.calls.lock().unwrap().push(key.clone());
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&key) {
                Some(q) if q.len() > 1 => q.pop_front(),
                Some(q) => q.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Reply::Bytes(b)) => Ok(b),
            Some(Reply::Unavailable) => Err(CaptureError::DeviceUnavailable("device offline".into())),
            Some(Reply::Fail(msg)) => Err(CaptureError::Command(msg.into())),
            Some(Reply::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(CaptureError::CaptureTimeout(timeout))
            }
            None => Err(CaptureError::Command(format!("unscripted: {key}"))),
        }
    }
}

/// `screencap` raw output: 12-byte header plus a `w x h` RGBA gradient.
pub fn raw_framebuffer(w: u32, h: u32, format: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + (w * h * 4) as usize);
    out.extend_from_slice(&w.to_le_bytes());
    out.extend_from_slice(&h.to_le_bytes());
    out.extend_from_slice(&format.to_le_bytes());
    for y in 0..h {
        for x in 0..w {
            out.extend_from_slice(&[(x * 7) as u8, (y * 13) as u8, 128, 255]);
        }
    }
    out
}

pub fn png_image(w: u32, h: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(w, h, |x, y| image::Rgba([x as u8, y as u8, 200, 255]));
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(img.as_raw(), w, h, image::ExtendedColorType::Rgba8)
        .unwrap();
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Fresh empty directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let dir = std::env::temp_dir().join(format!(
        "droidcast-{tag}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Executable `/bin/sh` script at `dir/name`.
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stand-in scrcpy/ffmpeg pair living in `dir`.
///
/// The producer answers `--version` and otherwise idles. The decoder writes
/// one 4x4 PNG to stdout, then runs `decoder_tail`. The FIFO goes into
/// `dir/fifo`, which is empty unless a pipeline is running.
#[cfg(unix)]
pub fn fake_pipeline(dir: &Path, decoder_tail: &str) -> ScrcpyConfig {
    let png = dir.join("frame.png");
    std::fs::write(&png, png_image(4, 4)).unwrap();
    let fifo_dir = dir.join("fifo");
    std::fs::create_dir_all(&fifo_dir).unwrap();
    ScrcpyConfig {
        scrcpy_path: script(dir, "scrcpy", "[ \"$1\" = \"--version\" ] && exit 0\nexec sleep 30"),
        decoder_path: script(
            dir,
            "ffmpeg",
            &format!("cat '{}'\n{decoder_tail}", png.display()),
        ),
        first_frame_timeout_ms: 5_000,
        poll_interval_ms: 10,
        terminate_grace_ms: 500,
        fifo_dir: Some(fifo_dir),
        ..ScrcpyConfig::default()
    }
}
