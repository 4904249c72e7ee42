//! Single-instance lock.
//!
//! The lock is an exclusive advisory lock (`fs2`) on `<locks_dir>/<name>.lock`.
//! The operating system releases it when the holding process exits, however
//! it exits, so a lock file left behind by a killed run never blocks the next
//! one. The file holds the PID of the current owner for diagnostics and is
//! kept in place after release.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Held single-instance lock; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

fn record_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

impl InstanceLock {
    /// Try to acquire the lock `name` in `locks_dir`.
    ///
    /// # Errors
    /// `SingleInstance` if another process holds the lock, `Config` if the
    /// lock file cannot be opened or locked for any other reason.
    pub fn acquire(locks_dir: &Path, name: &str) -> Result<Self, EngineError> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(EngineError::config(format!("Invalid lock name: {}", name)));
        }
        fs::create_dir_all(locks_dir).map_err(|e| {
            EngineError::config(format!(
                "Cannot create locks directory {}: {}",
                locks_dir.display(),
                e
            ))
        })?;
        let path = locks_dir.join(format!("{}.lock", name));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                EngineError::config(format!("Cannot open lock file {}: {}", path.display(), e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                debug!(lock = %path.display(), pid = %holder.trim(), "lock is held");
                return Err(EngineError::SingleInstance {
                    lock: name.to_string(),
                });
            }
            Err(e) => {
                return Err(EngineError::config(format!(
                    "Cannot lock {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        if let Err(e) = record_pid(&mut file) {
            warn!(lock = %path.display(), error = %e, "could not record PID in lock file");
        }
        debug!(lock = %path.display(), "lock acquired");
        Ok(InstanceLock { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!(lock = %self.path.display(), "lock released"),
            Err(e) => debug!(lock = %self.path.display(), error = %e, "unlock failed"),
        }
    }
}
