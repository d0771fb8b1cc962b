//! Per-changeset build lock
//!
//! The lock is a file created with create-new semantics, so exactly one
//! party can hold it. It is removed on release or when the guard drops.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::errors::{MaterializeError, MaterializeResult};

/// Held build lock
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    held: bool,
}

impl BuildLock {
    /// Create the lock file; `None` if someone else holds it
    pub fn try_acquire(path: &Path) -> MaterializeResult<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // Owner pid, for humans inspecting a stuck lock.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    held: true,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(MaterializeError::io(path, e)),
        }
    }

    /// Remove the lock file
    pub fn release(mut self) -> MaterializeResult<()> {
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MaterializeError::io(&self.path, e)),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove build lock");
            }
        }
    }
}
