//! Temporary checkpoints: commits on shadow branches.

use std::fs;
use std::path::{Component, Path};

use chrono::{DateTime, TimeZone, Utc};
use git2::{Oid, Repository};
use walkdir::WalkDir;

use super::{session_metadata_dir, task_metadata_dir, CONTEXT_FILE, PROMPT_FILE, TRANSCRIPT_FILE};
use crate::error::{EntireError, EntireResult};
use crate::gitstore::{self, EntrySpec, TreeEdits, MODE_BLOB, MODE_BLOB_EXECUTABLE, MODE_LINK};
use crate::trailers;
use crate::worktree::is_admin_path;

/// Upper bound on commits walked when listing a shadow branch.
pub const MAX_TEMPORARY_WALK: usize = 500;

const MAX_SWAP_ATTEMPTS: usize = 5;

/// Metadata for a task (subagent) checkpoint.
#[derive(Debug, Clone)]
pub struct TaskCheckpoint<'a> {
    pub tool_use_id: &'a str,
    /// On-disk directory whose regular files are copied into the checkpoint.
    pub metadata_dir: &'a Path,
}

/// Inputs for [`write_temporary`].
#[derive(Debug, Clone)]
pub struct WriteTemporaryOptions<'a> {
    pub session_id: &'a str,
    pub base_commit: &'a str,
    pub branch: &'a str,
    /// Worktree paths that were created or modified.
    pub modified_files: &'a [String],
    /// Worktree paths that were deleted.
    pub deleted_files: &'a [String],
    /// On-disk session metadata directory (transcript, prompts, context).
    pub metadata_dir: Option<&'a Path>,
    pub task: Option<TaskCheckpoint<'a>>,
    /// Subject line of the shadow commit.
    pub message: &'a str,
}

/// A checkpoint read back from a shadow branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryCheckpoint {
    pub commit: String,
    pub branch: String,
    pub session_id: String,
    pub base_commit: String,
    pub metadata_dir: String,
    pub task_metadata_dir: Option<String>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl TemporaryCheckpoint {
    pub fn is_task(&self) -> bool {
        self.task_metadata_dir.is_some()
    }

    fn from_commit(commit: &git2::Commit<'_>, branch: &str) -> Option<Self> {
        let message = commit.message().unwrap_or_default();
        let session_id = trailers::value(message, trailers::SESSION)?;
        let metadata_dir = trailers::value(message, trailers::METADATA)?;
        let created_at = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Some(Self {
            commit: commit.id().to_string(),
            branch: branch.to_string(),
            session_id,
            base_commit: trailers::value(message, trailers::BASE_COMMIT).unwrap_or_default(),
            metadata_dir,
            task_metadata_dir: trailers::value(message, trailers::METADATA_TASK),
            subject: commit.summary().unwrap_or_default().to_string(),
            created_at,
        })
    }
}

/// Session files stored inside a temporary checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub transcript: Option<Vec<u8>>,
    pub prompts: Option<String>,
    pub context: Option<String>,
}

fn validate_rel_path(path: &str) -> EntireResult<()> {
    let p = Path::new(path);
    let escapes = p.is_absolute()
        || p
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if path.is_empty() || escapes {
        return Err(EntireError::InvalidInput(format!("path escapes the worktree: {path}")));
    }
    Ok(())
}

/// Blob for a worktree file, or `None` if it no longer exists.
fn worktree_entry(repo: &Repository, root: &Path, rel: &str) -> EntireResult<Option<EntrySpec>> {
    let full = root.join(rel);
    let meta = match fs::symlink_metadata(&full) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if meta.file_type().is_symlink() {
        let target = fs::read_link(&full)?;
        let oid = repo.blob(target.to_string_lossy().as_bytes())?;
        return Ok(Some(EntrySpec { oid, mode: MODE_LINK }));
    }
    if !meta.is_file() {
        return Ok(None);
    }

    let oid = repo.blob(&fs::read(&full)?)?;
    Ok(Some(EntrySpec {
        oid,
        mode: file_mode(&meta),
    }))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        MODE_BLOB_EXECUTABLE
    } else {
        MODE_BLOB
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> i32 {
    MODE_BLOB
}

/// Add every regular file under `src` to `edits` below `dest`.
///
/// Symbolic links are neither followed nor recorded: a link planted in the
/// metadata directory must not pull arbitrary files into the checkpoint.
pub fn copy_metadata_dir(repo: &Repository, src: &Path, dest: &str, edits: &mut TreeEdits) -> EntireResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false).follow_root_links(false) {
        let entry = entry.map_err(|e| EntireError::Other(format!("walking {}: {e}", src.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let oid = repo.blob(&fs::read(entry.path())?)?;
        edits.insert(format!("{dest}/{rel}"), Some(EntrySpec::blob(oid)));
        copied += 1;
    }
    Ok(copied)
}

fn commit_message(opts: &WriteTemporaryOptions<'_>) -> String {
    let meta_dir = session_metadata_dir(opts.session_id);
    let mut pairs: Vec<(&str, &str)> = vec![(trailers::METADATA, meta_dir.as_str())];
    let task_dir = opts
        .task
        .as_ref()
        .map(|t| task_metadata_dir(opts.session_id, t.tool_use_id));
    if let Some(dir) = &task_dir {
        pairs.push((trailers::METADATA_TASK, dir.as_str()));
    }
    pairs.push((trailers::SESSION, opts.session_id));
    pairs.push((trailers::BASE_COMMIT, opts.base_commit));
    format!("{}\n\n{}", opts.message.trim(), trailers::format_block(&pairs))
}

/// Record a temporary checkpoint on `opts.branch`.
///
/// The new commit's parent is the branch tip, or the base commit when the
/// branch does not exist yet. Returns `None` when the resulting tree is
/// identical to the parent's (nothing new to record).
pub fn write_temporary(
    repo: &Repository,
    worktree_root: &Path,
    opts: &WriteTemporaryOptions<'_>,
) -> EntireResult<Option<TemporaryCheckpoint>> {
    let mut edits = TreeEdits::new();
    for rel in opts.modified_files {
        validate_rel_path(rel)?;
        if is_admin_path(rel) {
            continue;
        }
        edits.insert(rel.clone(), worktree_entry(repo, worktree_root, rel)?);
    }
    for rel in opts.deleted_files {
        validate_rel_path(rel)?;
        if !is_admin_path(rel) {
            edits.insert(rel.clone(), None);
        }
    }
    if let Some(dir) = opts.metadata_dir {
        copy_metadata_dir(repo, dir, &session_metadata_dir(opts.session_id), &mut edits)?;
    }
    if let Some(task) = &opts.task {
        validate_rel_path(task.tool_use_id)?;
        let dest = task_metadata_dir(opts.session_id, task.tool_use_id);
        copy_metadata_dir(repo, task.metadata_dir, &dest, &mut edits)?;
    }

    let base_oid = Oid::from_str(opts.base_commit)
        .map_err(|_| EntireError::InvalidInput(format!("bad base commit: {}", opts.base_commit)))?;
    let refname = gitstore::branch_ref(opts.branch);
    let message = commit_message(opts);
    let sig = gitstore::signature(repo)?;

    for _ in 0..MAX_SWAP_ATTEMPTS {
        let tip = gitstore::branch_tip(repo, opts.branch)?;
        let parent = repo
            .find_commit(tip.unwrap_or(base_oid))
            .map_err(|e| EntireError::Corrupt(format!("{}: {}", opts.branch, e.message())))?;
        let parent_tree = parent.tree()?;
        let tree_oid = gitstore::apply_edits(repo, Some(&parent_tree), &edits)?;
        if tree_oid == parent_tree.id() {
            tracing::debug!(branch = opts.branch, "no changes since last checkpoint");
            return Ok(None);
        }
        let tree = repo.find_tree(tree_oid)?;
        let oid = repo.commit(None, &sig, &sig, &message, &tree, &[&parent])?;

        match gitstore::swap_ref(repo, &refname, tip, oid, "entire: temporary checkpoint") {
            Ok(()) => {
                let commit = repo.find_commit(oid)?;
                return TemporaryCheckpoint::from_commit(&commit, opts.branch)
                    .map(Some)
                    .ok_or_else(|| EntireError::Corrupt(format!("checkpoint {oid} lost its trailers")));
            }
            Err(EntireError::RefUpdateConflict(_)) => {
                tracing::debug!(branch = opts.branch, "shadow branch moved, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(EntireError::RefUpdateConflict(refname))
}

/// Checkpoints on `branch`, newest first, stopping at the first commit that
/// is not a checkpoint (the base commit) or after `limit` commits.
pub fn list_temporary(repo: &Repository, branch: &str, limit: usize) -> EntireResult<Vec<TemporaryCheckpoint>> {
    let Some(tip) = gitstore::branch_tip(repo, branch)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut cursor = Some(repo.find_commit(tip)?);
    while let Some(commit) = cursor {
        if out.len() >= limit.min(MAX_TEMPORARY_WALK) {
            break;
        }
        let Some(checkpoint) = TemporaryCheckpoint::from_commit(&commit, branch) else {
            break;
        };
        out.push(checkpoint);
        cursor = commit.parent(0).ok();
    }
    Ok(out)
}

/// The newest checkpoint on `branch`.
pub fn latest_temporary(repo: &Repository, branch: &str) -> EntireResult<Option<TemporaryCheckpoint>> {
    Ok(list_temporary(repo, branch, 1)?.into_iter().next())
}

/// The checkpoint recorded by `commit`, or None if it is not a checkpoint.
pub fn read_temporary(repo: &Repository, commit: Oid, branch: &str) -> EntireResult<Option<TemporaryCheckpoint>> {
    let commit = repo
        .find_commit(commit)
        .map_err(|e| EntireError::Corrupt(format!("{commit}: {}", e.message())))?;
    Ok(TemporaryCheckpoint::from_commit(&commit, branch))
}

/// Read a session's transcript, prompts and context from checkpoint `commit`.
pub fn read_session_snapshot(repo: &Repository, commit: Oid, session_id: &str) -> EntireResult<SessionSnapshot> {
    let commit = repo
        .find_commit(commit)
        .map_err(|e| EntireError::Corrupt(format!("{commit}: {}", e.message())))?;
    let tree = commit.tree()?;
    let dir = session_metadata_dir(session_id);
    let text = |bytes: Option<Vec<u8>>| bytes.map(|b| String::from_utf8_lossy(&b).to_string());

    Ok(SessionSnapshot {
        transcript: gitstore::read_blob(repo, &tree, &format!("{dir}/{TRANSCRIPT_FILE}"))?,
        prompts: text(gitstore::read_blob(repo, &tree, &format!("{dir}/{PROMPT_FILE}"))?),
        context: text(gitstore::read_blob(repo, &tree, &format!("{dir}/{CONTEXT_FILE}"))?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitstore::testutil::{commit_files, init_repo};
    use tempfile::tempdir;

    fn opts<'a>(base: &'a str, modified: &'a [String], meta: Option<&'a Path>) -> WriteTemporaryOptions<'a> {
        WriteTemporaryOptions {
            session_id: "sess-1",
            base_commit: base,
            branch: "entire/abc1234-1",
            modified_files: modified,
            deleted_files: &[],
            metadata_dir: meta,
            task: None,
            message: "Checkpoint",
        }
    }

    #[test]
    fn test_write_and_list_temporary() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("app.py", "print(1)\n")], "init").to_string();

        let meta = tempdir().unwrap();
        fs::write(meta.path().join(TRANSCRIPT_FILE), "{\"type\":\"user\"}\n").unwrap();
        fs::write(meta.path().join(PROMPT_FILE), "hello").unwrap();

        fs::write(dir.path().join("app.py"), "print(2)\n").unwrap();
        let modified = vec!["app.py".to_string()];
        let cp = write_temporary(&repo, dir.path(), &opts(&base, &modified, Some(meta.path())))
            .unwrap()
            .unwrap();
        assert_eq!(cp.session_id, "sess-1");
        assert_eq!(cp.base_commit, base);
        assert_eq!(cp.metadata_dir, ".entire/metadata/sess-1");

        let commit = repo.find_commit(Oid::from_str(&cp.commit).unwrap()).unwrap();
        assert_eq!(commit.parent_id(0).unwrap().to_string(), base);
        let tree = commit.tree().unwrap();
        assert_eq!(gitstore::read_blob(&repo, &tree, "app.py").unwrap().unwrap(), b"print(2)\n");

        let snap = read_session_snapshot(&repo, commit.id(), "sess-1").unwrap();
        assert_eq!(snap.prompts.as_deref(), Some("hello"));
        assert!(snap.context.is_none());

        // Same content again: nothing to record.
        assert!(write_temporary(&repo, dir.path(), &opts(&base, &modified, Some(meta.path())))
            .unwrap()
            .is_none());

        fs::write(dir.path().join("app.py"), "print(3)\n").unwrap();
        write_temporary(&repo, dir.path(), &opts(&base, &modified, None)).unwrap().unwrap();
        let listed = list_temporary(&repo, "entire/abc1234-1", 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].commit, cp.commit);

        let read = read_temporary(&repo, commit.id(), "entire/abc1234-1").unwrap();
        assert_eq!(read, Some(cp));
        let base_oid = Oid::from_str(&base).unwrap();
        assert!(read_temporary(&repo, base_oid, "entire/abc1234-1").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_metadata_symlinks_are_not_copied() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a")], "init").to_string();

        let secret_dir = tempdir().unwrap();
        fs::write(secret_dir.path().join("id_rsa"), "SECRET").unwrap();

        let meta = tempdir().unwrap();
        fs::write(meta.path().join(TRANSCRIPT_FILE), "{}\n").unwrap();
        std::os::unix::fs::symlink(secret_dir.path().join("id_rsa"), meta.path().join("leak.txt")).unwrap();
        std::os::unix::fs::symlink(secret_dir.path(), meta.path().join("leakdir")).unwrap();

        let cp = write_temporary(&repo, dir.path(), &opts(&base, &[], Some(meta.path())))
            .unwrap()
            .unwrap();
        let tree = repo.find_commit(Oid::from_str(&cp.commit).unwrap()).unwrap().tree().unwrap();
        let files = gitstore::tree_files(&tree).unwrap();
        assert!(files.contains_key(".entire/metadata/sess-1/full.jsonl"));
        assert!(!files.keys().any(|p| p.contains("leak")));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a")], "init").to_string();
        let modified = vec!["../outside.txt".to_string()];
        let err = write_temporary(&repo, dir.path(), &opts(&base, &modified, None)).unwrap_err();
        assert!(matches!(err, EntireError::InvalidInput(_)));
    }

    #[test]
    fn test_task_checkpoint_trailer() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a")], "init").to_string();
        let task_meta = tempdir().unwrap();
        fs::write(task_meta.path().join("checkpoint.json"), "{}").unwrap();

        let mut o = opts(&base, &[], None);
        o.task = Some(TaskCheckpoint {
            tool_use_id: "toolu_01",
            metadata_dir: task_meta.path(),
        });
        let cp = write_temporary(&repo, dir.path(), &o).unwrap().unwrap();
        assert!(cp.is_task());
        assert_eq!(cp.task_metadata_dir.as_deref(), Some(".entire/metadata/sess-1/tasks/toolu_01"));
    }
}
