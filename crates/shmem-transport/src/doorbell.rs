//! Named-FIFO doorbells for cross-process wakeup.
//!
//! Each side of a segment listens on one FIFO next to the segment file and
//! rings the other side's. Both ends are opened `O_RDWR | O_NONBLOCK`, so an
//! open never blocks waiting for a partner, a write never raises `SIGPIPE`,
//! and the FIFO survives the peer coming and going.
//!
//! A ring is a single byte. When the pipe is full the byte is dropped; the
//! listener is already signalled.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Receiving end of a doorbell, registered with the tokio reactor
pub struct Doorbell {
    async_fd: AsyncFd<OwnedFd>,
    path: PathBuf,
}

impl Doorbell {
    /// Create (if needed) and listen on the FIFO at `path`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the FIFO cannot be created or opened, or if
    /// `path` exists but is not a FIFO.
    pub fn listen(path: &Path) -> io::Result<Self> {
        let fd = open_fifo(path)?;
        let async_fd = AsyncFd::new(fd)?;
        Ok(Self {
            async_fd,
            path: path.to_path_buf(),
        })
    }

    /// Wait until the doorbell has been rung, draining pending rings.
    ///
    /// # Errors
    ///
    /// Returns reactor registration errors.
    pub async fn wait(&self) -> io::Result<()> {
        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;
            if self.try_drain() {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    /// Drain pending rings without waiting
    pub fn drain(&self) {
        self.try_drain();
    }

    /// Returns true if at least one byte was read.
    fn try_drain(&self) -> bool {
        let fd = self.async_fd.get_ref().as_raw_fd();
        let mut buf = [0u8; 64];
        let mut drained = false;

        loop {
            // SAFETY: fd is open and buf is writable for its length.
            let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if ret > 0 {
                drained = true;
            } else if ret == 0 {
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != ErrorKind::WouldBlock && err.kind() != ErrorKind::Interrupted {
                    tracing::warn!("Doorbell drain on {} failed: {}", self.path.display(), err);
                }
                if err.kind() != ErrorKind::Interrupted {
                    break;
                }
            }
        }

        drained
    }

    /// FIFO path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell").field("path", &self.path).finish()
    }
}

/// Sending end of the peer's doorbell.
///
/// The FIFO is opened lazily on the first ring, so the peer may create it
/// after us. It is never created from this side: a peer that already tore
/// down must not get its doorbell back.
#[derive(Debug)]
pub struct RemoteDoorbell {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl RemoteDoorbell {
    /// Doorbell at `path`; nothing is opened yet
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fd: None,
        }
    }

    /// Ring the peer. Failures are logged and otherwise ignored; the peer's
    /// fallback poll still picks the change up.
    pub fn ring(&mut self) {
        if self.fd.is_none() {
            match open_existing(&self.path) {
                Ok(fd) => self.fd = Some(fd),
                Err(e) => {
                    tracing::trace!("Doorbell {} not available: {}", self.path.display(), e);
                    return;
                }
            }
        }
        let Some(fd) = &self.fd else {
            return;
        };

        let buf = [1u8];
        // SAFETY: fd is open and buf is valid for one byte.
        let ret = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                tracing::warn!("Doorbell ring on {} failed: {}", self.path.display(), err);
                self.fd = None;
            }
        }
    }

    /// Whether the FIFO has been opened
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }
}

/// Create the FIFO if missing and open it non-blocking for read and write.
fn open_fifo(path: &Path) -> io::Result<OwnedFd> {
    make_fifo(path)?;
    open_existing(path)
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "path contains NUL"))?;
    // SAFETY: c_path is a valid NUL-terminated string.
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

fn open_existing(path: &Path) -> io::Result<OwnedFd> {
    let meta = std::fs::metadata(path)?;
    if !meta.file_type().is_fifo() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} is not a FIFO", path.display()),
        ));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)?;
    Ok(file.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ring_and_wait() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bell");
        let bell = Doorbell::listen(&path).unwrap();
        let mut remote = RemoteDoorbell::new(&path);

        remote.ring();
        assert!(remote.is_open());
        tokio::time::timeout(Duration::from_millis(200), bell.wait())
            .await
            .expect("timeout waiting for doorbell")
            .expect("wait failed");
    }

    #[tokio::test]
    async fn test_multiple_rings_drain_at_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bell");
        let bell = Doorbell::listen(&path).unwrap();
        let mut remote = RemoteDoorbell::new(&path);

        for _ in 0..10 {
            remote.ring();
        }
        tokio::time::timeout(Duration::from_millis(200), bell.wait())
            .await
            .expect("timeout")
            .expect("wait failed");

        // drained: a second wait must not complete without a new ring
        let second = tokio::time::timeout(Duration::from_millis(50), bell.wait()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_remote_before_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bell");
        let mut remote = RemoteDoorbell::new(&path);
        remote.ring();
        assert!(!remote.is_open());
        assert!(!path.exists());

        let bell = Doorbell::listen(&path).unwrap();
        remote.ring();
        assert!(remote.is_open());
        tokio::time::timeout(Duration::from_millis(200), bell.wait())
            .await
            .expect("timeout")
            .expect("wait failed");
    }

    #[tokio::test]
    async fn test_non_fifo_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();
        assert!(Doorbell::listen(&path).is_err());
    }
}
