//! Exclusive lock on a provisioner root.
//!
//! Two provisioners sharing one root would each rebuild bookkeeping from the
//! same directories and destroy each other's rootfses as unknown orphans.
//! `flock` makes the second one fail at startup instead. The holder writes
//! its pid into the lock file so the refusal can name it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::files;

/// Holds an exclusive lock on a provisioner root until dropped.
///
/// The OS also releases the lock when the process exits or crashes.
pub struct ProvisionerLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for ProvisionerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerLock")
            .field("path", &self.path)
            .finish()
    }
}

impl ProvisionerLock {
    /// Acquire the lock without blocking.
    ///
    /// Fails with `StrataError::Internal` if another provisioner holds it.
    pub fn acquire(root: &Path) -> StrataResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| StrataError::Storage(format!("failed to create root dir: {}", e)))?;

        let lock_path = root.join(files::LOCK);

        // Not truncated on open: the current holder's pid must survive a
        // failed attempt.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StrataError::Storage(format!("failed to open lock file: {}", e)))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let holder = holder_pid(&lock_path)
                    .map(|pid| format!(" (pid {})", pid))
                    .unwrap_or_default();
                return Err(StrataError::Internal(format!(
                    "Another provisioner{} is already using directory: {}",
                    holder,
                    root.display()
                )));
            }
            Err((_, errno)) => {
                return Err(StrataError::Storage(format!(
                    "failed to acquire lock on {}: {}",
                    lock_path.display(),
                    errno
                )));
            }
        };

        lock.set_len(0)
            .and_then(|()| writeln!(lock, "{}", std::process::id()))
            .map_err(|e| StrataError::Storage(format!("failed to record lock holder: {}", e)))?;

        tracing::debug!(lock_path = %lock_path.display(), "Acquired provisioner lock");

        Ok(Self {
            _lock: lock,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProvisionerLock {
    fn drop(&mut self) {
        // `Flock` unlocks when the field drops.
        tracing::debug!(lock_path = %self.path.display(), "Released provisioner lock");
    }
}

/// Pid recorded by whoever last held the lock at `lock_path`.
pub fn holder_pid(lock_path: &Path) -> Option<u32> {
    std::fs::read_to_string(lock_path)
        .ok()?
        .trim()
        .parse()
        .ok()
}
