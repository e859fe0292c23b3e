//! Named pipe between the producer and the decoder.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::adb::sanitize_device_id;
use crate::error::CaptureError;

/// A FIFO on the filesystem, unlinked on [`remove`](NamedPipe::remove) or
/// drop, whichever comes first.
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
    removed: bool,
}

impl NamedPipe {
    /// Create `{dir}/droidcast-{device}-{pid}.mkv`, replacing a stale one.
    pub fn create(dir: &Path, device_id: &str) -> Result<Self, CaptureError> {
        let path = dir.join(format!(
            "droidcast-{}-{}.mkv",
            sanitize_device_id(device_id),
            std::process::id()
        ));
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale pipe"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CaptureError::PipelineStartupFailure(format!(
                    "cannot clear {}: {e}",
                    path.display()
                )));
            }
        }
        mkfifo(&path).map_err(|e| {
            CaptureError::PipelineStartupFailure(format!("mkfifo {}: {e}", path.display()))
        })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the pipe. Safe to call more than once.
    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            debug!(path = %self.path.display(), error = %e, "pipe not removed");
        }
    }
}

#[cfg(unix)]
fn mkfifo(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the call's duration.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn mkfifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn create_remove_is_idempotent() {
        let dir = std::env::temp_dir();
        let mut pipe = NamedPipe::create(&dir, "10.0.0.2:5555").unwrap();
        let path = pipe.path().to_path_buf();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        pipe.remove().unwrap();
        pipe.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn drop_unlinks() {
        let dir = std::env::temp_dir();
        let path = {
            let pipe = NamedPipe::create(&dir, "drop-test").unwrap();
            pipe.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
