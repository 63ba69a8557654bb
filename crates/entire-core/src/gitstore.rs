//! Thin helpers over libgit2 shared by the checkpoint stores.
//!
//! Every mutation here is expressed as "write new objects, then move one
//! reference". Reference moves go through [`swap_ref`], which refuses to
//! clobber a reference that changed since it was read.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};

use crate::error::{EntireError, EntireResult};

/// File mode for regular blobs.
pub const MODE_BLOB: i32 = 0o100644;
/// File mode for executable blobs.
pub const MODE_BLOB_EXECUTABLE: i32 = 0o100755;
/// File mode for symbolic links.
pub const MODE_LINK: i32 = 0o120000;
/// File mode for subtrees.
pub const MODE_TREE: i32 = 0o040000;

/// Open the repository containing `path`.
pub fn open_repo(path: &Path) -> EntireResult<Repository> {
    Repository::discover(path).map_err(|e| match e.code() {
        ErrorCode::NotFound => EntireError::NotARepo,
        _ => EntireError::Git(e),
    })
}

pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

/// Resolve a local branch to its tip. `None` when the branch does not exist.
pub fn branch_tip(repo: &Repository, branch: &str) -> EntireResult<Option<Oid>> {
    match repo.find_reference(&branch_ref(branch)) {
        Ok(reference) => {
            let resolved = reference.resolve()?;
            resolved
                .target()
                .map(Some)
                .ok_or_else(|| EntireError::Corrupt(format!("branch {branch} has no target")))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete a local branch. Returns whether it existed.
pub fn delete_branch(repo: &Repository, branch: &str) -> EntireResult<bool> {
    match repo.find_reference(&branch_ref(branch)) {
        Ok(mut reference) => {
            reference.delete()?;
            Ok(true)
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Local branch names starting with `prefix`.
pub fn list_branches(repo: &Repository, prefix: &str) -> EntireResult<Vec<String>> {
    let mut names = Vec::new();
    for branch in repo.branches(Some(git2::BranchType::Local))? {
        let (branch, _) = branch?;
        if let Some(name) = branch.name()? {
            if name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// The commit HEAD points at, or `None` on an unborn branch.
pub fn head_commit(repo: &Repository) -> EntireResult<Option<git2::Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Move `refname` from `expected` to `new` atomically.
///
/// `expected == None` means the reference must not exist yet. Losing the
/// race yields [`EntireError::RefUpdateConflict`] so callers can rebuild on
/// top of the new tip and retry.
pub fn swap_ref(
    repo: &Repository,
    refname: &str,
    expected: Option<Oid>,
    new: Oid,
    log_message: &str,
) -> EntireResult<()> {
    let result = match expected {
        Some(old) => repo.reference_matching(refname, new, true, old, log_message),
        None => repo.reference(refname, new, false, log_message),
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) if matches!(e.code(), ErrorCode::Modified | ErrorCode::Exists) => {
            Err(EntireError::RefUpdateConflict(refname.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Signature for commits entire creates on its own branches.
pub fn signature(repo: &Repository) -> EntireResult<git2::Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(git2::Signature::now("entire", "entire@localhost")?),
    }
}

/// A blob or tree to place at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpec {
    pub oid: Oid,
    pub mode: i32,
}

impl EntrySpec {
    pub fn blob(oid: Oid) -> Self {
        Self {
            oid,
            mode: MODE_BLOB,
        }
    }
}

/// Path-keyed edits: `Some` inserts or replaces, `None` removes (a file or a
/// whole directory).
pub type TreeEdits = BTreeMap<String, Option<EntrySpec>>;

/// Apply `edits` on top of `base` and write the resulting tree.
///
/// Removing a directory and adding files below it in the same edit set
/// replaces the directory wholesale. Directories left empty are dropped.
pub fn apply_edits(repo: &Repository, base: Option<&Tree<'_>>, edits: &TreeEdits) -> EntireResult<Oid> {
    let borrowed: BTreeMap<&str, Option<EntrySpec>> =
        edits.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    build_tree(repo, base, &borrowed)
}

fn build_tree(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    edits: &BTreeMap<&str, Option<EntrySpec>>,
) -> EntireResult<Oid> {
    let mut builder = repo.treebuilder(base)?;
    let mut nested: BTreeMap<&str, BTreeMap<&str, Option<EntrySpec>>> = BTreeMap::new();

    for (path, edit) in edits {
        let path = path.trim_matches('/');
        match path.split_once('/') {
            Some((dir, rest)) => {
                nested.entry(dir).or_default().insert(rest, *edit);
            }
            None => match edit {
                Some(spec) => {
                    builder.insert(path, spec.oid, spec.mode)?;
                }
                None => {
                    if builder.get(path)?.is_some() {
                        builder.remove(path)?;
                    }
                }
            },
        }
    }

    for (dir, sub_edits) in &nested {
        let replaced = matches!(edits.get(dir), Some(None));
        let existing = if replaced {
            None
        } else {
            match builder.get(dir)? {
                Some(entry) if entry.kind() == Some(ObjectType::Tree) => Some(repo.find_tree(entry.id())?),
                _ => None,
            }
        };
        let sub_oid = build_tree(repo, existing.as_ref(), sub_edits)?;
        if repo.find_tree(sub_oid)?.is_empty() {
            if builder.get(dir)?.is_some() {
                builder.remove(dir)?;
            }
        } else {
            builder.insert(dir, sub_oid, MODE_TREE)?;
        }
    }

    Ok(builder.write()?)
}

/// Blob ID at `path` in `tree`, if a blob lives there.
pub fn blob_oid_at(tree: &Tree<'_>, path: &str) -> EntireResult<Option<Oid>> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(entry.id())),
        Ok(_) => Ok(None),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Contents of the blob at `path` in `tree`.
pub fn read_blob(repo: &Repository, tree: &Tree<'_>, path: &str) -> EntireResult<Option<Vec<u8>>> {
    match blob_oid_at(tree, path)? {
        Some(oid) => {
            let blob = repo
                .find_blob(oid)
                .map_err(|e| EntireError::Corrupt(format!("{path}: {}", e.message())))?;
            Ok(Some(blob.content().to_vec()))
        }
        None => Ok(None),
    }
}

/// Subtree at `path`, if one exists.
pub fn subtree<'r>(repo: &'r Repository, tree: &Tree<'_>, path: &str) -> EntireResult<Option<Tree<'r>>> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) if entry.kind() == Some(ObjectType::Tree) => Ok(Some(repo.find_tree(entry.id())?)),
        Ok(_) => Ok(None),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Every blob in `tree` as `path -> (oid, mode)`.
pub fn tree_files(tree: &Tree<'_>) -> EntireResult<BTreeMap<String, EntrySpec>> {
    let mut files = BTreeMap::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                files.insert(
                    format!("{dir}{name}"),
                    EntrySpec {
                        oid: entry.id(),
                        mode: entry.filemode(),
                    },
                );
            }
        }
        TreeWalkResult::Ok
    })?;
    Ok(files)
}

/// Paths that differ between `old` (or the empty tree) and `new`.
pub fn changed_files(repo: &Repository, old: Option<&Tree<'_>>, new: &Tree<'_>) -> EntireResult<BTreeSet<String>> {
    let diff = repo.diff_tree_to_tree(old, Some(new), None)?;
    let mut paths = BTreeSet::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            if let Some(p) = file.path() {
                paths.insert(p.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(paths)
}

/// True while git is in the middle of a rebase.
pub fn is_rebase_in_progress(repo: &Repository) -> bool {
    let git_dir = repo.path();
    git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
}

/// The git directory shared by all worktrees. A linked worktree's own git
/// directory names it in its `commondir` file.
pub fn common_dir(repo: &Repository) -> PathBuf {
    let git_dir = repo.path();
    match fs::read_to_string(git_dir.join("commondir")) {
        Ok(raw) if !raw.trim().is_empty() => git_dir.join(raw.trim()),
        _ => git_dir.to_path_buf(),
    }
}

/// Short (7 character) form of a commit hash.
pub fn short_hash(hash: &str) -> &str {
    &hash[..7.min(hash.len())]
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_apply_edits_nested_insert_and_remove() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a"), ("src/lib.rs", "lib"), ("src/x/y.rs", "y")], "init");
        let base_tree = repo.find_commit(base).unwrap().tree().unwrap();

        let mut edits = TreeEdits::new();
        edits.insert("src/new.rs".into(), Some(EntrySpec::blob(repo.blob(b"new").unwrap())));
        edits.insert("src/x/y.rs".into(), None);
        let oid = apply_edits(&repo, Some(&base_tree), &edits).unwrap();
        let tree = repo.find_tree(oid).unwrap();

        let files = tree_files(&tree).unwrap();
        let names: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a.txt", "src/lib.rs", "src/new.rs"]);
        assert_eq!(read_blob(&repo, &tree, "src/new.rs").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_apply_edits_replaces_directory() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("meta/old.txt", "old"), ("keep.txt", "k")], "init");
        let base_tree = repo.find_commit(base).unwrap().tree().unwrap();

        let mut edits = TreeEdits::new();
        edits.insert("meta".into(), None);
        edits.insert("meta/new.txt".into(), Some(EntrySpec::blob(repo.blob(b"n").unwrap())));
        let tree = repo.find_tree(apply_edits(&repo, Some(&base_tree), &edits).unwrap()).unwrap();

        assert!(blob_oid_at(&tree, "meta/old.txt").unwrap().is_none());
        assert!(blob_oid_at(&tree, "meta/new.txt").unwrap().is_some());
        assert!(blob_oid_at(&tree, "keep.txt").unwrap().is_some());
    }

    #[test]
    fn test_swap_ref_detects_lost_race() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let first = commit_files(&repo, &[("a", "1")], "one");
        let second = commit_files(&repo, &[("a", "2")], "two");

        swap_ref(&repo, "refs/heads/meta", None, first, "create").unwrap();
        let err = swap_ref(&repo, "refs/heads/meta", None, second, "create again").unwrap_err();
        assert!(matches!(err, EntireError::RefUpdateConflict(_)));

        let err = swap_ref(&repo, "refs/heads/meta", Some(second), first, "stale").unwrap_err();
        assert!(matches!(err, EntireError::RefUpdateConflict(_)));

        swap_ref(&repo, "refs/heads/meta", Some(first), second, "advance").unwrap();
        assert_eq!(branch_tip(&repo, "meta").unwrap(), Some(second));
    }

    #[test]
    fn test_branch_helpers() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let head = commit_files(&repo, &[("a", "1")], "one");
        assert!(branch_tip(&repo, "entire/abc1234-1").unwrap().is_none());
        repo.reference("refs/heads/entire/abc1234-1", head, false, "t").unwrap();
        assert_eq!(list_branches(&repo, "entire/").unwrap(), vec!["entire/abc1234-1"]);
        assert!(delete_branch(&repo, "entire/abc1234-1").unwrap());
        assert!(!delete_branch(&repo, "entire/abc1234-1").unwrap());
    }

    #[test]
    fn test_changed_files_and_rebase_marker() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let one = commit_files(&repo, &[("a", "1"), ("b", "1")], "one");
        let two = commit_files(&repo, &[("a", "2")], "two");
        let t1 = repo.find_commit(one).unwrap().tree().unwrap();
        let t2 = repo.find_commit(two).unwrap().tree().unwrap();
        let changed = changed_files(&repo, Some(&t1), &t2).unwrap();
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["a"]);

        assert!(!is_rebase_in_progress(&repo));
        std::fs::create_dir_all(repo.path().join("rebase-merge")).unwrap();
        assert!(is_rebase_in_progress(&repo));
    }

    #[test]
    fn test_common_dir_is_shared_by_linked_worktrees() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_files(&repo, &[("a.txt", "a")], "init");
        assert_eq!(common_dir(&repo), repo.path());

        let outside = tempdir().unwrap();
        let wt_path = outside.path().join("wt");
        repo.worktree("wt", &wt_path, None).unwrap();
        let linked = Repository::open(&wt_path).unwrap();
        assert_ne!(linked.path(), repo.path());
        assert_eq!(
            common_dir(&linked).canonicalize().unwrap(),
            repo.path().canonicalize().unwrap()
        );
    }
}
