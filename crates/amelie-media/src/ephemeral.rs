//! Ephemeral storage for in-flight media.
//!
//! Every acquired payload lives in its own uuid-named file inside the spool
//! directory. A [`ScopedHandle`] deletes its file exactly once: explicitly via
//! [`ScopedHandle::release`], or on drop, whichever comes first. Dropping
//! covers early returns, `?`, cancelled futures and panics alike.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::error::EphemeralError;

const SPOOL_EXTENSION: &str = "media";

/// Subdirectory of the configured spool root that this store owns.
pub const SPOOL_SUBDIR: &str = "amelie-spool";

/// Notified once per physical release. Used for accounting in tests and logs.
pub trait ReleaseObserver: Send + Sync {
    fn on_release(&self, path: &Path);
}

/// Spool directory manager.
#[derive(Clone)]
pub struct EphemeralStore {
    dir: PathBuf,
    observer: Option<Arc<dyn ReleaseObserver>>,
}

impl EphemeralStore {
    /// Use `root/amelie-spool` as the spool directory, creating it
    /// (owner-only on unix) if needed. `root` itself is left untouched.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = root.into().join(SPOOL_SUBDIR);
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReleaseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete spool files left behind by a previous process (e.g. after a crash).
    ///
    /// Returns the number of files removed.
    pub fn sweep(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_spool = path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION);
            if is_spool {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "Swept residual spool files");
        }
        Ok(removed)
    }

    /// Number of payload files currently on disk.
    pub fn resident_count(&self) -> std::io::Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Store `payload` in a fresh file and return the handle that owns it.
    pub async fn acquire(&self, payload: Bytes) -> Result<ScopedHandle, EphemeralError> {
        let path = self
            .dir
            .join(format!("{}.{SPOOL_EXTENSION}", uuid::Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&path)
            .await
            .map_err(EphemeralError::AcquireFailed)?;

        // From here on the handle owns the file, so a failed write still
        // removes whatever was written.
        let handle = ScopedHandle {
            path,
            len: payload.len() as u64,
            released: AtomicBool::new(false),
            observer: self.observer.clone(),
        };

        let written = async {
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await;
        drop(file);
        written.map_err(EphemeralError::AcquireFailed)?;

        debug!(path = %handle.path.display(), len = handle.len, "Acquired ephemeral payload");
        Ok(handle)
    }
}

/// Exclusive owner of one spooled payload file.
pub struct ScopedHandle {
    path: PathBuf,
    len: u64,
    released: AtomicBool,
    observer: Option<Arc<dyn ReleaseObserver>>,
}

impl ScopedHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Read the stored bytes back.
    pub async fn read(&self) -> Result<Vec<u8>, EphemeralError> {
        if self.is_released() {
            return Err(EphemeralError::AlreadyReleased);
        }
        tokio::fs::read(&self.path)
            .await
            .map_err(EphemeralError::AcquireFailed)
    }

    /// Delete the stored bytes.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// release; later calls are no-ops.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(path = %self.path.display(), "{}", EphemeralError::AlreadyReleased);
            return false;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released ephemeral payload"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            // The startup sweep removes anything that survives here.
            Err(e) => error!(path = %self.path.display(), "Failed to delete payload: {e}"),
        }

        if let Some(observer) = &self.observer {
            observer.on_release(&self.path);
        }
        true
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ScopedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("released", &self.is_released())
            .finish()
    }
}
