//! Sharing the metadata branch with a remote.
//!
//! Transport goes through the `git` executable so the user's credential
//! helpers and SSH configuration apply unchanged.

use std::io::BufRead;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use git2::Repository;

use crate::checkpoint::committed::METADATA_BRANCH;
use crate::error::{EntireError, EntireResult};
use crate::gitstore;

/// How long an interactive confirmation waits before assuming "no".
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the remote metadata tip lands before it is merged locally. The
/// remote may be a URL or a path, so it is not part of the ref name.
const FETCH_REF: &str = "refs/entire/fetched-checkpoints";

fn run_git(worktree_root: &Path, args: &[&str]) -> EntireResult<String> {
    let output = Command::new("git").args(args).current_dir(worktree_root).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(EntireError::Other(format!("git {}: {stderr}", args.join(" "))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Push the metadata branch to `remote`.
///
/// Runs with `--no-verify` so the push does not re-enter our own pre-push
/// hook.
pub fn push_metadata_branch(worktree_root: &Path, remote: &str) -> EntireResult<()> {
    let refspec = format!("refs/heads/{METADATA_BRANCH}:refs/heads/{METADATA_BRANCH}");
    run_git(worktree_root, &["push", "--no-verify", "--quiet", remote, &refspec])?;
    tracing::info!(remote, "pushed checkpoint metadata");
    Ok(())
}

/// What [`fetch_metadata_branch`] did to the local branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The remote has no metadata branch.
    Missing,
    /// Local branch created from the remote.
    Created,
    /// Local branch fast-forwarded.
    FastForwarded,
    /// Local branch already contains the remote tip.
    UpToDate,
    /// Histories diverged; the local branch was left alone.
    Diverged,
}

/// Fetch the remote metadata branch and fast-forward the local one.
pub fn fetch_metadata_branch(repo: &Repository, worktree_root: &Path, remote: &str) -> EntireResult<FetchOutcome> {
    let refspec = format!("+refs/heads/{METADATA_BRANCH}:{FETCH_REF}");
    if let Err(e) = run_git(worktree_root, &["fetch", "--quiet", remote, &refspec]) {
        tracing::debug!(remote, error = %e, "metadata branch not fetched");
        return Ok(FetchOutcome::Missing);
    }
    let remote_tip = match repo.refname_to_id(FETCH_REF) {
        Ok(oid) => oid,
        Err(_) => return Ok(FetchOutcome::Missing),
    };

    let refname = gitstore::branch_ref(METADATA_BRANCH);
    let outcome = match gitstore::branch_tip(repo, METADATA_BRANCH)? {
        None => {
            gitstore::swap_ref(repo, &refname, None, remote_tip, "entire: fetch checkpoint metadata")?;
            FetchOutcome::Created
        }
        Some(local) if local == remote_tip || repo.graph_descendant_of(local, remote_tip)? => FetchOutcome::UpToDate,
        Some(local) if repo.graph_descendant_of(remote_tip, local)? => {
            gitstore::swap_ref(repo, &refname, Some(local), remote_tip, "entire: fetch checkpoint metadata")?;
            FetchOutcome::FastForwarded
        }
        Some(_) => {
            tracing::warn!(remote, "local and remote checkpoint metadata diverged");
            FetchOutcome::Diverged
        }
    };
    Ok(outcome)
}

/// Ask a yes/no question on stderr and read the answer from stdin.
///
/// Returns false when nobody answers within `timeout`.
pub fn confirm_with_timeout(prompt: &str, timeout: Duration) -> bool {
    eprint!("{prompt} [y/N] ");
    confirm_from(std::io::BufReader::new(std::io::stdin()), timeout)
}

/// Read one answer line from `reader` on a background thread.
pub fn confirm_from<R>(mut reader: R, timeout: Duration) -> bool
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let answer = reader.read_line(&mut line).map(|_| line);
        let _ = tx.send(answer);
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "could not read confirmation");
            false
        }
        Err(_) => {
            tracing::warn!(seconds = timeout.as_secs(), "no answer, assuming no");
            false
        }
    }
}
