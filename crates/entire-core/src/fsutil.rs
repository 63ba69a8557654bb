//! Filesystem utilities for crash-safe writes.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::EntireResult;

/// Write data to a file atomically using temp-file-then-rename.
///
/// Session state files are rewritten by every hook invocation; a hook killed
/// mid-write must leave either the old or the new JSON on disk.
pub fn atomic_write(path: &Path, data: &[u8]) -> EntireResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.entire-tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_data()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write `data` only when `path` does not exist yet. Returns true if written.
pub fn write_if_absent(path: &Path, data: &[u8]) -> EntireResult<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Remove empty directories from `dir` upwards, stopping at `stop_at`.
pub fn remove_empty_dirs(dir: &Path, stop_at: &Path) -> std::io::Result<()> {
    let mut current = dir.to_path_buf();
    while current != stop_at && current.starts_with(stop_at) {
        if fs::read_dir(&current)?.next().is_none() {
            fs::remove_dir(&current)?;
        } else {
            break;
        }
        match current.parent() {
            Some(p) => current = p.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}
