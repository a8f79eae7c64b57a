//! Advisory locking.
//!
//! Every open stream holds a shared `flock` on the mailbox file for its
//! whole lifetime. Writers (append, expunge, copy into a mailbox) first take
//! an exclusive `flock` on a separate lock file named after the mailbox's
//! device and inode. Only the holder of that lock may try to upgrade its
//! mailbox lock to exclusive, since a `flock` upgrade drops the old lock
//! before taking the new one.

use std::fs::{File, Metadata};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::{debug, warn};

use crate::error::LockError;

fn apply(file: &File, path: &Path, arg: FlockArg) -> Result<(), LockError> {
    flock(file.as_raw_fd(), arg).map_err(|e| LockError::io(path, e.into()))
}

/// `Ok(false)` when a non-blocking request would have had to wait.
fn try_apply(file: &File, path: &Path, arg: FlockArg) -> Result<bool, LockError> {
    match flock(file.as_raw_fd(), arg) {
        Ok(()) => Ok(true),
        Err(e) if e == Errno::EWOULDBLOCK => Ok(false),
        Err(e) => Err(LockError::io(path, e.into())),
    }
}

/// Take the long-lived shared lock on an open mailbox file.
pub fn lock_shared(file: &File, path: &Path) -> Result<(), LockError> {
    apply(file, path, FlockArg::LockShared)
}

/// Upgrade the mailbox lock to exclusive without waiting.
///
/// Fails with [`LockError::InUse`] when any other stream has the mailbox
/// open. The caller's shared lock may have been dropped by the failed
/// attempt, so it is taken again before returning.
pub fn upgrade_exclusive(file: &File, path: &Path) -> Result<(), LockError> {
    if try_apply(file, path, FlockArg::LockExclusiveNonblock)? {
        return Ok(());
    }
    lock_shared(file, path)?;
    Err(LockError::InUse(path.to_path_buf()))
}

/// Return an exclusive mailbox lock to shared.
pub fn downgrade_shared(file: &File, path: &Path) -> Result<(), LockError> {
    lock_shared(file, path)
}

/// Lock file used to serialise writers of the mailbox described by `meta`.
pub fn lock_file_path(lock_dir: &Path, meta: &Metadata) -> PathBuf {
    lock_dir.join(format!(".{:x}.{:x}", meta.dev(), meta.ino()))
}

/// An exclusive lock on a mailbox's writer lock file, released on drop.
///
/// The lock file itself is left in place: removing it would let a waiter
/// that already opened the old inode race with a newcomer that creates a
/// new one.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Wait for the writer lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let file = open_lock_file(&path)?;
        apply(&file, &path, FlockArg::LockExclusive)?;
        debug!(path = %path.display(), "Acquired writer lock");
        Ok(Self { file, path })
    }

    /// Take the writer lock only if nobody holds it.
    pub fn try_acquire(path: impl Into<PathBuf>) -> Result<Option<Self>, LockError> {
        let path = path.into();
        let file = open_lock_file(&path)?;
        if !try_apply(&file, &path, FlockArg::LockExclusiveNonblock)? {
            return Ok(None);
        }
        debug!(path = %path.display(), "Acquired writer lock");
        Ok(Some(Self { file, path }))
    }

    /// Whether some other holder currently has the writer lock.
    pub fn is_held(path: impl Into<PathBuf>) -> Result<bool, LockError> {
        Ok(Self::try_acquire(path)?.is_none())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = apply(&self.file, &self.path, FlockArg::Unlock) {
            warn!(error = %e, "Failed to release writer lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| LockError::io(path, e))
}
