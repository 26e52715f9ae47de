//! Advisory file locks shared between independently launched processes.

use log::trace;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A held `flock(2)` lock. Released when dropped.
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held.
    pub fn exclusive<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path.as_ref(), FlockArg::LockExclusive)
    }

    /// Block until a shared lock on `path` is held.
    pub fn shared<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path.as_ref(), FlockArg::LockShared)
    }

    fn acquire(path: &Path, arg: FlockArg) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let lock = loop {
            match Flock::lock(file, arg) {
                Ok(lock) => break lock,
                Err((returned, Errno::EINTR)) => file = returned,
                Err((_, errno)) => return Err(io::Error::from(errno)),
            }
        };

        trace!(
            "Locked {} ({})",
            path.display(),
            if matches!(arg, FlockArg::LockExclusive) { "exclusive" } else { "shared" }
        );
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The flock itself is released when `_lock` drops.
        trace!("Unlocked {}", self.path.display());
    }
}
