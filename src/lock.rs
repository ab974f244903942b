//! Per-(environment, service) advisory locks.
//!
//! Backup and cleanup of the same service in the same environment must not
//! overlap, whether they come from two CLI invocations or from the periodic
//! scheduler firing while an ad-hoc run is still going. A non-blocking
//! `flock(2)` on `<backup-root>/<env>/<service>/.lock` serialises them; the
//! kernel drops the lock if the holder dies.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::LockError;

const LOCK_FILE: &str = ".lock";

/// Held lock; released on drop
#[derive(Debug)]
pub struct ServiceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl ServiceLock {
    /// Try to lock `service_dir`, creating it if needed. Never blocks.
    pub fn acquire(service_dir: &Path) -> Result<Self, LockError> {
        let path = service_dir.join(LOCK_FILE);
        let io_err = |reason: String| LockError::Io {
            path: path.clone(),
            reason,
        };

        fs::create_dir_all(service_dir).map_err(|e| io_err(e.to_string()))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| io_err(e.to_string()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!(path = %path.display(), "acquired service lock");
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(LockError::Contended { path }),
            Err((_, errno)) => Err(io_err(errno.to_string())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
