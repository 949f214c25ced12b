//! Session checkpoints
//!
//! The running session is persisted after every emission so a power loss
//! cannot lose its identity. Writes go to a temp file which is synced and
//! renamed over the checkpoint, so readers see either the old or the new
//! snapshot, never a mix.

use crate::error::CheckpointError;
use crate::session::SessionSnapshot;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomic single-file store for the in-progress session
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store at `path`
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the checkpoint
    ///
    /// # Errors
    /// `CheckpointError::Io` / `Format` on write failure.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }

    /// Read the checkpoint, if any
    ///
    /// # Errors
    /// `CheckpointError::Io` on read failure, `Format` on an unreadable file.
    pub fn load(&self) -> Result<Option<SessionSnapshot>, CheckpointError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    /// Remove the checkpoint; missing files are fine
    ///
    /// # Errors
    /// `CheckpointError::Io` if removal fails for another reason.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    /// Move an unreadable checkpoint aside so the next boot starts clean
    ///
    /// Returns where it went, or `None` if there was nothing to move.
    ///
    /// # Errors
    /// `CheckpointError::Io` if the file can be neither renamed nor removed.
    pub fn quarantine(&self) -> Result<Option<PathBuf>, CheckpointError> {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bad");
        let aside = PathBuf::from(name);
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => Ok(Some(aside)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                tracing::warn!("cannot move checkpoint aside: {e}");
                self.clear().map(|()| None)
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}
