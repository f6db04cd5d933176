use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use keystone_core::InstallLayout;

use crate::command::{run_checked, CommandRunner};
use crate::fs_utils::{create_dir_tree, path_exists, remove_path_if_exists};
use crate::privilege::{HostIdentity, ADMIN_STAFF_GID, SUPERUSER_UID, WHEEL_GID};

pub const TAR_PATH: &str = "/usr/bin/tar";
const QUARANTINE_ATTRIBUTE: &str = "com.apple.quarantine";
const ALLOWED_TICKET_STORE_GIDS: [u32; 2] = [WHEEL_GID, ADMIN_STAFF_GID];

/// Ways of stripping the quarantine attribute from a bundle tree, tried in
/// order until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineStrategy {
    XattrRecursiveDelete,
    XattrDeleteRecursive,
    FindExecXattr,
}

pub const QUARANTINE_STRATEGIES: [QuarantineStrategy; 3] = [
    QuarantineStrategy::XattrRecursiveDelete,
    QuarantineStrategy::XattrDeleteRecursive,
    QuarantineStrategy::FindExecXattr,
];

impl QuarantineStrategy {
    pub fn command(self, target: &Path) -> Command {
        match self {
            Self::XattrRecursiveDelete => {
                let mut command = Command::new("/usr/bin/xattr");
                command.args(["-r", "-d", QUARANTINE_ATTRIBUTE]).arg(target);
                command
            }
            Self::XattrDeleteRecursive => {
                let mut command = Command::new("/usr/bin/xattr");
                command.args(["-d", "-r", QUARANTINE_ATTRIBUTE]).arg(target);
                command
            }
            Self::FindExecXattr => {
                let mut command = Command::new("/usr/bin/find");
                command
                    .arg(target)
                    .args(["-exec", "/usr/bin/xattr", "-d", QUARANTINE_ATTRIBUTE, "{}", ";"]);
                command
            }
        }
    }
}

/// Returns the strategy that worked, or `None` when every one failed.
pub fn clear_quarantine(
    runner: &dyn CommandRunner,
    strategies: &[QuarantineStrategy],
    target: &Path,
) -> Option<QuarantineStrategy> {
    for strategy in strategies {
        let mut command = strategy.command(target);
        match runner.run(&mut command) {
            Ok(output) if output.success() => return Some(*strategy),
            Ok(output) => {
                tracing::debug!(?strategy, status = ?output.status, "quarantine strategy failed");
            }
            Err(err) => {
                tracing::debug!(?strategy, error = %format!("{err:#}"), "quarantine strategy failed");
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleInstallOutcome {
    pub replaced_existing: bool,
    pub quarantine_cleared: Option<QuarantineStrategy>,
}

/// Places a bundle on disk with rollback to the previous one on failure.
///
/// Callers bracket every call with privilege on system installs.
pub struct BundleInstaller<'a> {
    layout: &'a InstallLayout,
    runner: &'a dyn CommandRunner,
    identity: &'a dyn HostIdentity,
    quarantine_strategies: &'a [QuarantineStrategy],
}

impl<'a> BundleInstaller<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        runner: &'a dyn CommandRunner,
        identity: &'a dyn HostIdentity,
        quarantine_strategies: &'a [QuarantineStrategy],
    ) -> Self {
        Self {
            layout,
            runner,
            identity,
            quarantine_strategies,
        }
    }

    /// Creates `dir` and any missing parents. On system installs each level
    /// created here becomes root:wheel 0755; pre-existing levels are left as
    /// they are.
    pub fn ensure_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let system = self.layout.is_system();
        create_dir_tree(dir, |created| {
            if system {
                self.set_root_owned(created, 0o755)?;
            }
            Ok(())
        })
    }

    pub fn set_root_owned(&self, path: &Path, mode: u32) -> Result<()> {
        self.identity
            .set_owner(path, SUPERUSER_UID, WHEEL_GID)
            .with_context(|| format!("failed to set owner root:wheel on {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))?;
        Ok(())
    }

    pub fn install_archive(&self, package: &Path) -> Result<BundleInstallOutcome> {
        let parent = self.layout.keystone_dir();
        let current = self.layout.bundle_dir();
        let backup = self.layout.backup_bundle_dir();

        self.ensure_dir(&parent)?;

        // A backup with no current bundle means an earlier run died after
        // moving the bundle aside; that backup is the last working bundle.
        if !path_exists(&current) && path_exists(&backup) {
            fs::rename(&backup, &current).with_context(|| {
                format!(
                    "failed to recover {} from {}",
                    current.display(),
                    backup.display()
                )
            })?;
            tracing::warn!(bundle = %current.display(), "recovered bundle left aside by an interrupted install");
        }

        let replaced_existing = path_exists(&current);
        if replaced_existing {
            remove_path_if_exists(&backup)
                .with_context(|| format!("failed to remove stale backup {}", backup.display()))?;
            fs::rename(&current, &backup).with_context(|| {
                format!(
                    "failed to move {} aside to {}",
                    current.display(),
                    backup.display()
                )
            })?;
        }

        if let Err(err) = self.extract(package, &parent) {
            if replaced_existing {
                self.restore_backup(&current, &backup)?;
                tracing::warn!(bundle = %current.display(), "extraction failed; previous bundle restored");
            } else if let Err(cleanup) = remove_path_if_exists(&current) {
                tracing::warn!(bundle = %current.display(), error = %cleanup, "failed to clear partial bundle");
            }
            return Err(err);
        }

        if replaced_existing {
            if let Err(err) = remove_path_if_exists(&backup) {
                tracing::warn!(backup = %backup.display(), error = %err, "failed to remove bundle backup");
            }
        }

        let quarantine_cleared =
            clear_quarantine(self.runner, self.quarantine_strategies, &current);
        Ok(BundleInstallOutcome {
            replaced_existing,
            quarantine_cleared,
        })
    }

    fn extract(&self, package: &Path, parent: &Path) -> Result<()> {
        let mut command = build_extract_command(package, parent);
        run_checked(
            self.runner,
            &mut command,
            &format!("failed to extract {}", package.display()),
        )?;
        let current = self.layout.bundle_dir();
        if !current.is_dir() {
            return Err(anyhow!(
                "extraction of {} did not produce {}",
                package.display(),
                current.display()
            ));
        }
        Ok(())
    }

    fn restore_backup(&self, current: &Path, backup: &Path) -> Result<()> {
        remove_path_if_exists(current).with_context(|| {
            format!("failed to clear partial bundle at {}", current.display())
        })?;
        fs::rename(backup, current).with_context(|| {
            format!(
                "failed to restore {} from {}",
                current.display(),
                backup.display()
            )
        })
    }

    /// Prepares the ticket store for use.
    ///
    /// On system installs a store not owned by root with group wheel or admin
    /// staff may have been planted by someone else; it is destroyed and
    /// recreated rather than trusted.
    pub fn ensure_ticket_store(&self) -> Result<PathBuf> {
        let store = self.layout.ticket_store_dir();

        if path_exists(&store) {
            let trusted = if self.layout.is_system() {
                let (uid, gid) = self
                    .identity
                    .owner_of(&store)
                    .with_context(|| format!("failed to stat {}", store.display()))?;
                let owned = uid == SUPERUSER_UID && ALLOWED_TICKET_STORE_GIDS.contains(&gid);
                if !owned {
                    tracing::warn!(store = %store.display(), uid, gid, "ticket store has untrusted owner");
                }
                owned && store.is_dir()
            } else {
                store.is_dir()
            };
            if !trusted {
                remove_path_if_exists(&store)
                    .with_context(|| format!("failed to remove {}", store.display()))?;
            }
        }

        self.ensure_dir(&store)?;
        if self.layout.is_system() {
            self.set_root_owned(&store, 0o755)?;
        }
        Ok(store)
    }
}

pub(crate) fn build_extract_command(package: &Path, destination: &Path) -> Command {
    let mut command = Command::new(TAR_PATH);
    command
        .arg("-xzf")
        .arg(package)
        .arg("--no-same-owner")
        .arg("-C")
        .arg(destination);
    command
}

pub(crate) fn build_read_member_command(package: &Path, member: &str) -> Command {
    let mut command = Command::new(TAR_PATH);
    command.arg("-xOzf").arg(package).arg(member);
    command
}
