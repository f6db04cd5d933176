use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::privilege::HostIdentity;

const ACTIVES_REL_DIR: &str = "Library/Google/GoogleSoftwareUpdate/Actives";

/// Home directory of the real user. The password database wins over `$HOME`
/// when they disagree. The result always ends with a separator.
pub fn resolve_home_dir(identity: &dyn HostIdentity, env_home: Option<&str>) -> Option<PathBuf> {
    let from_passwd = identity
        .home_dir_for_uid(identity.real_uid())
        .map(|path| path.display().to_string());
    let home = from_passwd
        .or_else(|| env_home.map(str::to_string))
        .filter(|home| !home.is_empty())?;

    if home.ends_with('/') {
        Some(PathBuf::from(home))
    } else {
        Some(PathBuf::from(format!("{home}/")))
    }
}

pub fn activity_file_path(home: &Path, product_id: &str) -> PathBuf {
    home.join(ACTIVES_REL_DIR).join(product_id)
}

/// Marks `product_id` as used so the updater's activity check sees it.
///
/// The updater deletes the marker each time it checks, so an existing file is
/// left untouched. Any failure is silently abandoned; returns whether a new
/// marker was created.
pub fn touch_activity_file(home: &Path, product_id: &str) -> bool {
    if !home.is_dir() || product_id.is_empty() || product_id.contains('/') {
        return false;
    }

    let actives = home.join(ACTIVES_REL_DIR);
    if !actives.is_dir()
        && DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(&actives)
            .is_err()
    {
        return false;
    }

    let marker = activity_file_path(home, product_id);
    if marker.exists() {
        return false;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o666)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(&marker)
        .is_ok()
}
