use std::process::Command;

use keystone_core::InstallLayout;

use crate::command::CommandRunner;
use crate::fs_utils::remove_path_if_exists;

pub const LEGACY_RECEIPT_NAMES: [&str; 3] = ["Keystone", "UninstallKeystone", "NukeKeystone"];
const PKGUTIL_PATH: &str = "/usr/sbin/pkgutil";
const PACKAGE_ID_PREFIX: &str = "com.google.pkg.";

/// Deletes legacy package-manager receipts so an older package can be
/// installed again. Every failure is ignored; returns how many receipt
/// paths were removed.
pub fn remove_legacy_receipts(layout: &InstallLayout, runner: &dyn CommandRunner) -> usize {
    let mut removed = 0;
    for name in LEGACY_RECEIPT_NAMES {
        let receipt = layout.receipts_dir().join(format!("{name}.pkg"));
        match remove_path_if_exists(&receipt) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(
                    receipt = %receipt.display(),
                    error = %err,
                    "ignoring receipt removal failure"
                );
            }
        }

        let mut command = Command::new(PKGUTIL_PATH);
        command
            .arg("--forget")
            .arg(format!("{PACKAGE_ID_PREFIX}{name}"));
        if !matches!(runner.run(&mut command), Ok(output) if output.success()) {
            tracing::debug!(package = name, "package database forget failed");
        }
    }
    removed
}
