use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const SUPERUSER_UID: u32 = 0;
pub const WHEEL_GID: u32 = 0;
pub const ADMIN_STAFF_GID: u32 = 20;
pub const ELEVATED_UMASK: u32 = 0o022;

/// Identity and ownership primitives of the host.
pub trait HostIdentity {
    fn effective_ids(&self) -> (u32, u32);
    fn set_effective_uid(&self, uid: u32) -> io::Result<()>;
    fn set_effective_gid(&self, gid: u32) -> io::Result<()>;
    /// Sets the process umask and returns the previous one.
    fn swap_umask(&self, mask: u32) -> u32;
    fn real_uid(&self) -> u32;
    fn uid_for_user(&self, name: &str) -> Option<u32>;
    fn home_dir_for_uid(&self, uid: u32) -> Option<PathBuf>;
    fn owner_of(&self, path: &Path) -> io::Result<(u32, u32)>;
    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentity;

impl HostIdentity for SystemIdentity {
    fn effective_ids(&self) -> (u32, u32) {
        // SAFETY: geteuid/getegid cannot fail and touch no memory.
        unsafe { (libc::geteuid(), libc::getegid()) }
    }

    fn set_effective_uid(&self, uid: u32) -> io::Result<()> {
        // SAFETY: plain syscall wrapper.
        if unsafe { libc::seteuid(uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_effective_gid(&self, gid: u32) -> io::Result<()> {
        // SAFETY: plain syscall wrapper.
        if unsafe { libc::setegid(gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn swap_umask(&self, mask: u32) -> u32 {
        // SAFETY: umask cannot fail.
        unsafe { libc::umask(mask as libc::mode_t) as u32 }
    }

    fn real_uid(&self) -> u32 {
        // SAFETY: getuid cannot fail.
        unsafe { libc::getuid() }
    }

    fn uid_for_user(&self, name: &str) -> Option<u32> {
        let name = CString::new(name).ok()?;
        lookup_passwd(|entry, buf, result| {
            // SAFETY: all pointers reference live, correctly sized buffers.
            unsafe { libc::getpwnam_r(name.as_ptr(), entry, buf.as_mut_ptr(), buf.len(), result) }
        })
        .map(|entry| entry.uid)
    }

    fn home_dir_for_uid(&self, uid: u32) -> Option<PathBuf> {
        lookup_passwd(|entry, buf, result| {
            // SAFETY: all pointers reference live, correctly sized buffers.
            unsafe { libc::getpwuid_r(uid, entry, buf.as_mut_ptr(), buf.len(), result) }
        })
        .and_then(|entry| entry.home)
    }

    fn owner_of(&self, path: &Path) -> io::Result<(u32, u32)> {
        let metadata = fs::symlink_metadata(path)?;
        Ok((metadata.uid(), metadata.gid()))
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
    }
}

struct PasswdEntry {
    uid: u32,
    home: Option<PathBuf>,
}

fn lookup_passwd<Lookup>(lookup: Lookup) -> Option<PasswdEntry>
where
    Lookup: Fn(&mut libc::passwd, &mut Vec<libc::c_char>, &mut *mut libc::passwd) -> libc::c_int,
{
    // SAFETY: sysconf has no memory effects.
    let suggested = unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) };
    let size = usize::try_from(suggested).ok().filter(|size| *size > 0).unwrap_or(16 * 1024);
    let mut buf: Vec<libc::c_char> = vec![0; size];
    // SAFETY: passwd is plain old data; an all-zero value is valid storage.
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    if lookup(&mut entry, &mut buf, &mut result) != 0 || result.is_null() {
        return None;
    }

    let home = if entry.pw_dir.is_null() {
        None
    } else {
        // SAFETY: pw_dir points into `buf`, which outlives this read.
        let raw = unsafe { CStr::from_ptr(entry.pw_dir) };
        Some(PathBuf::from(raw.to_string_lossy().into_owned()))
    };
    Some(PasswdEntry {
        uid: entry.pw_uid,
        home,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeSnapshot {
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
}

/// Non-reentrant effective-identity elevation.
///
/// At most one snapshot is live at a time. Acquiring twice or releasing
/// without a live snapshot is a programming error and panics.
pub struct PrivilegeContext<'a> {
    identity: &'a dyn HostIdentity,
    snapshot: Cell<Option<PrivilegeSnapshot>>,
}

impl<'a> PrivilegeContext<'a> {
    pub fn new(identity: &'a dyn HostIdentity) -> Self {
        Self {
            identity,
            snapshot: Cell::new(None),
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.snapshot.get().is_some()
    }

    pub fn acquire(&self) -> Result<()> {
        assert!(
            self.snapshot.get().is_none(),
            "privilege context acquired while already elevated"
        );

        let (uid, gid) = self.identity.effective_ids();
        let umask = self.identity.swap_umask(ELEVATED_UMASK);
        let snapshot = PrivilegeSnapshot { uid, gid, umask };

        if let Err(err) = self.identity.set_effective_uid(SUPERUSER_UID) {
            self.identity.swap_umask(snapshot.umask);
            return Err(err).context("failed to elevate effective uid to superuser");
        }
        if let Err(err) = self.identity.set_effective_gid(WHEEL_GID) {
            let _ = self.identity.set_effective_uid(snapshot.uid);
            self.identity.swap_umask(snapshot.umask);
            return Err(err).context("failed to elevate effective gid to wheel");
        }

        self.snapshot.set(Some(snapshot));
        tracing::trace!(saved_uid = uid, saved_gid = gid, "privilege acquired");
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            panic!("privilege context released without a matching acquire");
        };

        let gid_result = self.identity.set_effective_gid(snapshot.gid);
        let uid_result = self.identity.set_effective_uid(snapshot.uid);
        self.identity.swap_umask(snapshot.umask);
        tracing::trace!(uid = snapshot.uid, gid = snapshot.gid, "privilege released");

        gid_result.with_context(|| format!("failed to restore effective gid {}", snapshot.gid))?;
        uid_result.with_context(|| format!("failed to restore effective uid {}", snapshot.uid))?;
        Ok(())
    }

    /// Runs `work` elevated. Release happens on every exit path, including
    /// errors and unwinding panics.
    pub fn elevated<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        self.acquire()?;
        let guard = ReleaseGuard {
            context: self,
            armed: true,
        };
        let result = work();
        let released = guard.finish();
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::error!(error = %format!("{release_err:#}"), "privilege release failed");
                Err(err)
            }
        }
    }
}

struct ReleaseGuard<'c, 'a> {
    context: &'c PrivilegeContext<'a>,
    armed: bool,
}

impl ReleaseGuard<'_, '_> {
    fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.context.release()
    }
}

impl Drop for ReleaseGuard<'_, '_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.context.release() {
                tracing::error!(error = %format!("{err:#}"), "privilege release failed");
            }
        }
    }
}
