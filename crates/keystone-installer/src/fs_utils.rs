use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Removes a file, symlink or directory tree. Returns whether anything was
/// there to remove.
pub fn remove_path_if_exists(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Creates `target` one level at a time and reports each level created.
///
/// Directories that already existed are left untouched, so callers can set
/// ownership on new levels only.
pub fn create_dir_tree<OnCreated>(target: &Path, mut on_created: OnCreated) -> Result<Vec<PathBuf>>
where
    OnCreated: FnMut(&Path) -> Result<()>,
{
    let mut missing = Vec::new();
    let mut cursor = Some(target);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() || path_exists(dir) {
            break;
        }
        missing.push(dir.to_path_buf());
        cursor = dir.parent();
    }

    let mut created = Vec::with_capacity(missing.len());
    for dir in missing.into_iter().rev() {
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", dir.display()));
            }
        }
        on_created(&dir)?;
        created.push(dir);
    }

    if !target.is_dir() {
        return Err(anyhow!("not a directory: {}", target.display()));
    }
    Ok(created)
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
pub fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    if let Err(err) = fs::write(&tmp, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("failed to write {}", tmp.display()));
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| {
            format!("failed to move {} into place at {}", tmp.display(), path.display())
        });
    }
    Ok(())
}
