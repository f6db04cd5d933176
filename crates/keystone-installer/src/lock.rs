use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Machine-wide advisory lock serialising install, uninstall and nuke runs.
///
/// Held until dropped (or process exit). The lock file is never removed:
/// unlinking it would let a waiter lock an orphaned inode while a newcomer
/// creates a fresh file.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Blocks until the lock is available. There is no timeout.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        // SAFETY: the descriptor belongs to `file`, which is alive here.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to lock {}", path.display()));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Returns `None` when another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        // SAFETY: the descriptor belongs to `file`, which is alive here.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err).with_context(|| format!("failed to lock {}", path.display()));
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    // flock needs only a readable descriptor; a file another user created is
    // opened read-only.
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            File::open(path).map_err(|read_err| {
                tracing::debug!(path = %path.display(), error = %err, "lock file not writable");
                read_err
            })
        }
        other => other,
    }
    .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    // World-readable so unprivileged runs can open a lock file root created.
    let mut permissions = file
        .metadata()
        .with_context(|| format!("failed to stat lock file: {}", path.display()))?
        .permissions();
    if permissions.mode() & 0o444 != 0o444 {
        permissions.set_mode(permissions.mode() | 0o444);
        let _ = fs::set_permissions(path, permissions);
    }
    Ok(file)
}
