//! Working tree identity and status.
//!
//! Status is reported relative to HEAD and the index, the way `git status`
//! sees it, with entire's own `.entire/` directory filtered out.

use std::collections::BTreeSet;
use std::path::PathBuf;

use git2::{Repository, Status, StatusOptions};
use serde::Serialize;

use crate::error::{EntireError, EntireResult};
use crate::settings::ENTIRE_DIR;

/// The type of change detected for a file.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Untracked file.
    New,
    /// Tracked file with different content (staged or not).
    Modified,
    /// Tracked file no longer on disk.
    Deleted,
}

/// A single file's status in the working directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileState {
    pub path: String,
    pub status: FileStatus,
}

/// Root directory of the worktree `repo` was opened from.
pub fn root(repo: &Repository) -> EntireResult<PathBuf> {
    repo.workdir()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| EntireError::InvalidInput("bare repositories are not supported".into()))
}

/// Stable identifier of the worktree: the linked-worktree name, or empty for
/// the main worktree.
pub fn worktree_id(repo: &Repository) -> String {
    if !repo.is_worktree() {
        return String::new();
    }
    repo.path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// True for paths inside entire's administrative directory.
pub fn is_admin_path(path: &str) -> bool {
    path == ENTIRE_DIR || path.starts_with(&format!("{ENTIRE_DIR}/"))
}

/// Changed and untracked files, sorted by path.
pub fn status(repo: &Repository) -> EntireResult<Vec<FileState>> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .renames_head_to_index(false);

    let mut changes = Vec::new();
    for entry in repo.statuses(Some(&mut opts))?.iter() {
        let Some(path) = entry.path() else {
            continue;
        };
        if is_admin_path(path) {
            continue;
        }
        let st = entry.status();
        let status = if st.intersects(Status::WT_NEW) && !st.intersects(Status::INDEX_NEW) {
            FileStatus::New
        } else if st.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
            FileStatus::Deleted
        } else if st.intersects(
            Status::WT_MODIFIED
                | Status::WT_TYPECHANGE
                | Status::WT_RENAMED
                | Status::INDEX_NEW
                | Status::INDEX_MODIFIED
                | Status::INDEX_TYPECHANGE
                | Status::INDEX_RENAMED,
        ) {
            FileStatus::Modified
        } else {
            continue;
        };
        changes.push(FileState {
            path: path.to_string(),
            status,
        });
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

/// True if nothing outside `.entire/` is modified or untracked.
pub fn is_clean(repo: &Repository) -> EntireResult<bool> {
    Ok(status(repo)?.is_empty())
}

/// Paths that are modified, deleted or untracked.
pub fn dirty_files(repo: &Repository) -> EntireResult<BTreeSet<String>> {
    Ok(status(repo)?.into_iter().map(|f| f.path).collect())
}

/// Untracked paths only.
pub fn untracked_files(repo: &Repository) -> EntireResult<BTreeSet<String>> {
    Ok(status(repo)?
        .into_iter()
        .filter(|f| f.status == FileStatus::New)
        .map(|f| f.path)
        .collect())
}
