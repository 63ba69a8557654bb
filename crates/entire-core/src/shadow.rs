//! Shadow branch naming and lifetime decisions.
//!
//! A shadow branch is named after the first seven hex characters of the
//! commit the agent's work is based on, plus a numeric suffix:
//! `entire/<hash7>-<N>`. Several work streams on the same base commit get
//! different suffixes; the highest one in use by a session is its current
//! stream and the others are frozen.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use git2::{Commit, Oid, Repository, Tree};

use crate::checkpoint::committed::METADATA_BRANCH;
use crate::error::{EntireError, EntireResult};
use crate::gitstore;
use crate::migrate;
use crate::session::SessionState;
use crate::worktree;

/// Prefix shared by every branch entire creates.
pub const SHADOW_PREFIX: &str = "entire/";

/// Upper bound on suffixes tried when allocating a fresh one.
pub const MAX_SUFFIX_SEARCH: u32 = 100;

/// `entire/<hash7>-<suffix>`.
pub fn shadow_branch_name(base_commit: &str, suffix: u32) -> String {
    format!("{}-{suffix}", legacy_branch_name(base_commit))
}

/// Unsuffixed `entire/<hash7>` written by older releases.
pub fn legacy_branch_name(base_commit: &str) -> String {
    format!("{SHADOW_PREFIX}{}", gitstore::short_hash(base_commit))
}

/// Split a shadow branch name into its short hash and optional suffix.
pub fn parse_shadow_branch(name: &str) -> Option<(String, Option<u32>)> {
    let rest = name.strip_prefix(SHADOW_PREFIX)?;
    let (hash, suffix) = match rest.split_once('-') {
        Some((hash, n)) => (hash, Some(n.parse::<u32>().ok().filter(|n| *n >= 1)?)),
        None => (rest, None),
    };
    if hash.len() != 7 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((hash.to_string(), suffix))
}

/// Every shadow branch in the repository, sorted by name.
pub fn list_shadow_branches(repo: &Repository) -> EntireResult<Vec<String>> {
    Ok(gitstore::list_branches(repo, SHADOW_PREFIX)?
        .into_iter()
        .filter(|b| b != METADATA_BRANCH && parse_shadow_branch(b).is_some())
        .collect())
}

/// Shadow branches (legacy and suffixed) for one base commit.
pub fn branches_for_base(repo: &Repository, base_commit: &str) -> EntireResult<Vec<String>> {
    let short = gitstore::short_hash(base_commit);
    Ok(list_shadow_branches(repo)?
        .into_iter()
        .filter(|b| parse_shadow_branch(b).is_some_and(|(h, _)| h == short))
        .collect())
}

pub fn delete_shadow_branch(repo: &Repository, branch: &str) -> EntireResult<bool> {
    if parse_shadow_branch(branch).is_none() {
        return Err(EntireError::InvalidInput(format!("not a shadow branch: {branch}")));
    }
    gitstore::delete_branch(repo, branch)
}

/// Point `to` at the tip of `from`. The source is deleted unless
/// `keep_source` is set (another session still builds on it).
pub fn rename_shadow_branch(
    repo: &Repository,
    from: &str,
    to: &str,
    keep_source: bool,
) -> EntireResult<()> {
    let tip = gitstore::branch_tip(repo, from)?
        .ok_or_else(|| EntireError::BranchNotFound(from.to_string()))?;
    gitstore::swap_ref(repo, &gitstore::branch_ref(to), None, tip, "entire: move shadow branch")?;
    if !keep_source {
        gitstore::delete_branch(repo, from)?;
    }
    tracing::debug!(from, to, keep_source, "moved shadow branch");
    Ok(())
}

/// Smallest suffix above `after` whose branch does not exist yet.
pub fn next_free_suffix(
    repo: &Repository,
    base_commit: &str,
    after: u32,
) -> EntireResult<Option<u32>> {
    for candidate in (after + 1)..=(after + MAX_SUFFIX_SEARCH) {
        if gitstore::branch_tip(repo, &shadow_branch_name(base_commit, candidate))?.is_none() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Outcome of [`determine_suffix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuffixDecision {
    pub suffix: u32,
    /// True when the checkpoint starts a new work stream.
    pub is_new: bool,
}

impl SuffixDecision {
    fn keep(suffix: u32) -> Self {
        Self { suffix, is_new: false }
    }
}

/// Decide which shadow branch the session's next checkpoint belongs on.
///
/// 1. No suffix yet: migrate a legacy branch to suffix 1, or start at 1.
/// 2. The current suffix's branch does not exist yet: keep it.
/// 3. The session already recorded checkpoints on it: keep it.
/// 4. Otherwise the branch holds somebody else's earlier work. Continue it
///    only if that work visibly survives in the worktree.
///
/// Git failures never abort the checkpoint: a failed legacy migration starts
/// at suffix 1, and failures during steps 2-4 keep the current suffix.
pub fn determine_suffix(repo: &Repository, state: &SessionState) -> EntireResult<SuffixDecision> {
    let base = state.base_commit.as_str();
    let short = gitstore::short_hash(base);
    let Some(current) = state.shadow_suffix else {
        return Ok(match migrate::migrate_legacy_shadow_branch(repo, base) {
            Ok(true) => SuffixDecision::keep(1),
            Ok(false) => SuffixDecision { suffix: 1, is_new: true },
            Err(e) => {
                tracing::debug!(base = short, error = %e, "legacy shadow migration failed");
                SuffixDecision { suffix: 1, is_new: true }
            }
        });
    };

    let branch = shadow_branch_name(base, current);
    let tip = match gitstore::branch_tip(repo, &branch) {
        Ok(Some(tip)) => tip,
        Ok(None) => return Ok(SuffixDecision::keep(current)),
        Err(e) => {
            tracing::debug!(branch = %branch, error = %e, "cannot resolve shadow branch");
            return Ok(SuffixDecision::keep(current));
        }
    };
    if state.checkpoint_count > 0 {
        return Ok(SuffixDecision::keep(current));
    }

    match prior_work_survives(repo, base, tip) {
        Ok(true) => Ok(SuffixDecision::keep(current)),
        Ok(false) => match next_free_suffix(repo, base, current) {
            Ok(Some(suffix)) => {
                tracing::debug!(base = short, suffix, "starting new shadow stream");
                Ok(SuffixDecision { suffix, is_new: true })
            }
            Ok(None) => {
                tracing::warn!(base = short, "no free shadow suffix, continuing current");
                Ok(SuffixDecision::keep(current))
            }
            Err(e) => {
                tracing::debug!(base = short, error = %e, "suffix search failed");
                Ok(SuffixDecision::keep(current))
            }
        },
        Err(e) => {
            tracing::debug!(branch = %branch, error = %e, "suffix analysis failed");
            Ok(SuffixDecision::keep(current))
        }
    }
}

/// Does any agent-written content on the shadow branch remain in the worktree?
fn prior_work_survives(repo: &Repository, base_commit: &str, tip: Oid) -> EntireResult<bool> {
    if worktree::is_clean(repo)? {
        return Ok(false);
    }

    let base_tree = repo.find_commit(Oid::from_str(base_commit)?)?.tree()?;
    let shadow_tree = repo.find_commit(tip)?.tree()?;
    let changed = gitstore::changed_files(repo, Some(&base_tree), &shadow_tree)?;
    let shadow_files: BTreeSet<String> = changed
        .into_iter()
        .filter(|p| !worktree::is_admin_path(p))
        .collect();
    let worktree_files = worktree::dirty_files(repo)?;

    let root = worktree::root(repo)?;
    for path in shadow_files.intersection(&worktree_files) {
        let base = read_text(repo, &base_tree, path)?;
        let shadow = read_text(repo, &shadow_tree, path)?;
        let current = read_worktree_text(&root, path)?;
        if agent_lines_survive(&base, &shadow, &current) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn read_text(repo: &Repository, tree: &Tree<'_>, path: &str) -> EntireResult<String> {
    Ok(gitstore::read_blob(repo, tree, path)?
        .map(|b| String::from_utf8_lossy(&b).to_string())
        .unwrap_or_default())
}

fn read_worktree_text(root: &Path, path: &str) -> EntireResult<String> {
    match fs::read(root.join(path)) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// True if a line the agent added (present in `shadow`, absent from `base`)
/// is still present in `current`.
///
/// Lines are compared as a set after trimming trailing whitespace; order is
/// ignored and blank lines never count.
pub fn agent_lines_survive(base: &str, shadow: &str, current: &str) -> bool {
    let lines = |text: &str| -> BTreeSet<String> {
        text.lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    };
    let base = lines(base);
    let current = lines(current);
    lines(shadow)
        .difference(&base)
        .any(|added| current.contains(added))
}

/// Whether `commit` contains work from a session that touched `touched`.
///
/// A touched file counts when the commit changed it and either it already
/// existed in the parent, or it is new and byte-identical to the copy on the
/// shadow branch. A missing shadow branch is treated as overlapping.
pub fn files_overlap_with_content(
    repo: &Repository,
    commit: &Commit<'_>,
    touched: &BTreeSet<String>,
    shadow_branch: &str,
) -> bool {
    let shadow_tree = match gitstore::branch_tip(repo, shadow_branch) {
        Ok(Some(tip)) => match repo.find_commit(tip).and_then(|c| c.tree()) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::debug!(branch = shadow_branch, error = %e, "unreadable shadow branch");
                return true;
            }
        },
        Ok(None) => return true,
        Err(e) => {
            tracing::debug!(branch = shadow_branch, error = %e, "cannot resolve shadow branch");
            return true;
        }
    };
    match overlap(commit, touched, &shadow_tree) {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(error = %e, "overlap check failed, assuming overlap");
            true
        }
    }
}

fn overlap(
    commit: &Commit<'_>,
    touched: &BTreeSet<String>,
    shadow_tree: &Tree<'_>,
) -> EntireResult<bool> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None,
    };

    for path in touched {
        let Some(committed) = gitstore::blob_oid_at(&tree, path)? else {
            continue;
        };
        let before = match &parent_tree {
            Some(pt) => gitstore::blob_oid_at(pt, path)?,
            None => None,
        };
        match before {
            Some(old) if old == committed => continue,
            Some(_) => return Ok(true),
            None => {
                if gitstore::blob_oid_at(shadow_tree, path)? == Some(committed) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitstore::testutil::{commit_files, commit_on_branch, init_repo};
    use std::path::Path as StdPath;
    use tempfile::tempdir;

    fn state_for(base: Oid, suffix: Option<u32>) -> SessionState {
        let mut state = SessionState::new("s1", &base.to_string(), StdPath::new("/w"), "");
        state.shadow_suffix = suffix;
        state
    }

    fn touched(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_branch_names() {
        let base = "abcdef0123456789abcdef0123456789abcdef01";
        assert_eq!(shadow_branch_name(base, 2), "entire/abcdef0-2");
        assert_eq!(legacy_branch_name(base), "entire/abcdef0");
        assert_eq!(parse_shadow_branch("entire/abcdef0-2"), Some(("abcdef0".into(), Some(2))));
        assert_eq!(parse_shadow_branch("entire/abcdef0"), Some(("abcdef0".into(), None)));
        assert_eq!(parse_shadow_branch("entire/abcdef0-0"), None);
        assert_eq!(parse_shadow_branch(METADATA_BRANCH), None);
        assert_eq!(parse_shadow_branch("main"), None);
    }

    #[test]
    fn test_first_suffix_is_new() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let d = determine_suffix(&repo, &state_for(base, None)).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 1, is_new: true });
    }

    #[test]
    fn test_legacy_branch_migrates_to_suffix_one() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let legacy = legacy_branch_name(&base.to_string());
        let tip = commit_on_branch(&repo, &legacy, base, &[("a.txt", "agent\n")]);

        let d = determine_suffix(&repo, &state_for(base, None)).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 1, is_new: false });
        assert!(gitstore::branch_tip(&repo, &legacy).unwrap().is_none());
        assert_eq!(
            gitstore::branch_tip(&repo, &shadow_branch_name(&base.to_string(), 1)).unwrap(),
            Some(tip)
        );
    }

    #[test]
    fn test_failed_legacy_migration_still_decides() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let legacy = legacy_branch_name(&base.to_string());
        let tip = commit_on_branch(&repo, &legacy, base, &[("a.txt", "agent\n")]);

        // A ref nested under the suffix-1 name makes creating that branch fail.
        let target = shadow_branch_name(&base.to_string(), 1);
        let blocker = format!("{}/held", gitstore::branch_ref(&target));
        repo.reference(&blocker, base, false, "test").unwrap();

        let d = determine_suffix(&repo, &state_for(base, None)).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 1, is_new: true });
        assert_eq!(gitstore::branch_tip(&repo, &legacy).unwrap(), Some(tip));
    }

    #[test]
    fn test_missing_branch_and_recorded_checkpoints_keep_suffix() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        assert_eq!(
            determine_suffix(&repo, &state_for(base, Some(3))).unwrap(),
            SuffixDecision { suffix: 3, is_new: false }
        );

        commit_on_branch(&repo, &shadow_branch_name(&base.to_string(), 1), base, &[("a.txt", "x\n")]);
        let mut state = state_for(base, Some(1));
        state.checkpoint_count = 2;
        // Clean worktree would otherwise force a new stream.
        assert_eq!(determine_suffix(&repo, &state).unwrap(), SuffixDecision { suffix: 1, is_new: false });
    }

    #[test]
    fn test_clean_worktree_starts_new_suffix() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        commit_on_branch(&repo, &shadow_branch_name(&base.to_string(), 1), base, &[("a.txt", "agent\n")]);

        let d = determine_suffix(&repo, &state_for(base, Some(1))).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 2, is_new: true });
    }

    #[test]
    fn test_new_suffix_skips_existing_branches() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let b = base.to_string();
        commit_on_branch(&repo, &shadow_branch_name(&b, 1), base, &[("a.txt", "one\n")]);
        commit_on_branch(&repo, &shadow_branch_name(&b, 2), base, &[("a.txt", "two\n")]);

        let d = determine_suffix(&repo, &state_for(base, Some(1))).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 3, is_new: true });
    }

    #[test]
    fn test_surviving_agent_line_keeps_suffix() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("app.py", "import os\n")], "init");
        commit_on_branch(
            &repo,
            &shadow_branch_name(&base.to_string(), 1),
            base,
            &[("app.py", "import os\ndef login():\n    pass\n")],
        );
        // User kept one agent line and edited the rest.
        fs::write(dir.path().join("app.py"), "import os\ndef login():   \n    return 1\n").unwrap();

        let d = determine_suffix(&repo, &state_for(base, Some(1))).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 1, is_new: false });
    }

    #[test]
    fn test_agent_lines_gone_starts_new_suffix() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("app.py", "import os\n")], "init");
        commit_on_branch(
            &repo,
            &shadow_branch_name(&base.to_string(), 1),
            base,
            &[("app.py", "import os\ndef login():\n    pass\n")],
        );
        fs::write(dir.path().join("app.py"), "import os\nprint('unrelated')\n").unwrap();

        let d = determine_suffix(&repo, &state_for(base, Some(1))).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 2, is_new: true });
    }

    #[test]
    fn test_no_overlap_starts_new_suffix() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("app.py", "a\n"), ("other.py", "o\n")], "init");
        commit_on_branch(&repo, &shadow_branch_name(&base.to_string(), 1), base, &[("app.py", "agent\n")]);
        fs::write(dir.path().join("other.py"), "agent\n").unwrap();

        let d = determine_suffix(&repo, &state_for(base, Some(1))).unwrap();
        assert_eq!(d, SuffixDecision { suffix: 2, is_new: true });
    }

    #[test]
    fn test_agent_lines_heuristic() {
        assert!(agent_lines_survive("a\n", "a\nb\n", "b\na\n"));
        assert!(agent_lines_survive("a\n", "a\nb  \n", "x\nb\n"));
        assert!(!agent_lines_survive("a\n", "a\nb\n", "a\n"));
        // Blank lines added by the agent do not keep the stream alive.
        assert!(!agent_lines_survive("a\n", "a\n\n\n", "a\n\n"));
    }

    #[test]
    fn test_overlap_modified_existing_file() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("app.py", "v1\n")], "init");
        let shadow = shadow_branch_name(&base.to_string(), 1);
        commit_on_branch(&repo, &shadow, base, &[("app.py", "agent\n")]);
        let head = commit_files(&repo, &[("app.py", "user rewrote it\n")], "edit");
        let commit = repo.find_commit(head).unwrap();

        assert!(files_overlap_with_content(&repo, &commit, &touched(&["app.py"]), &shadow));
    }

    #[test]
    fn test_overlap_new_file_requires_identical_content() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("keep.txt", "k\n")], "init");
        let shadow = shadow_branch_name(&base.to_string(), 1);
        commit_on_branch(&repo, &shadow, base, &[("new.py", "agent\n"), ("other.py", "agent\n")]);

        let same = commit_files(&repo, &[("new.py", "agent\n")], "carry");
        let commit = repo.find_commit(same).unwrap();
        assert!(files_overlap_with_content(&repo, &commit, &touched(&["new.py"]), &shadow));

        let differs = commit_files(&repo, &[("other.py", "rewritten\n")], "rewrite");
        let commit = repo.find_commit(differs).unwrap();
        assert!(!files_overlap_with_content(&repo, &commit, &touched(&["other.py"]), &shadow));
    }

    #[test]
    fn test_overlap_absent_file_and_missing_branch() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let shadow = shadow_branch_name(&base.to_string(), 1);
        commit_on_branch(&repo, &shadow, base, &[("b.txt", "b\n")]);
        let head = commit_files(&repo, &[("a.txt", "changed\n")], "edit");
        let commit = repo.find_commit(head).unwrap();

        assert!(!files_overlap_with_content(&repo, &commit, &touched(&["b.txt"]), &shadow));
        assert!(files_overlap_with_content(&repo, &commit, &touched(&["b.txt"]), "entire/0000000-9"));
    }

    #[test]
    fn test_rename_and_list() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let base = commit_files(&repo, &[("a.txt", "a\n")], "init");
        let b = base.to_string();
        let from = shadow_branch_name(&b, 1);
        commit_on_branch(&repo, &from, base, &[("x", "x\n")]);
        commit_on_branch(&repo, METADATA_BRANCH, base, &[("y", "y\n")]);

        rename_shadow_branch(&repo, &from, &shadow_branch_name(&b, 4), false).unwrap();
        assert_eq!(list_shadow_branches(&repo).unwrap(), vec![shadow_branch_name(&b, 4)]);
        assert_eq!(branches_for_base(&repo, &b).unwrap().len(), 1);
        assert!(matches!(
            rename_shadow_branch(&repo, &from, "entire/abc1234-1", false),
            Err(EntireError::BranchNotFound(_))
        ));
        assert!(delete_shadow_branch(&repo, "main").is_err());
    }
}
