//! Folding shadow-branch work into committed checkpoints.

use std::fs;

use git2::{Commit, Repository};

use crate::checkpoint::committed::{CommittedStore, UpdateCommittedOptions, WriteCommittedOptions};
use crate::checkpoint::{split_prompts, temporary};
use crate::error::{EntireError, EntireResult};
use crate::gitstore;
use crate::id::CheckpointId;
use crate::session::{SessionState, SessionStore};
use crate::shadow;
use crate::transcript::{generate_context, TranscriptAdapter};

/// Collaborators a condensation needs.
pub struct CondenseContext<'a> {
    pub repo: &'a Repository,
    pub sessions: &'a SessionStore,
    pub transcript: &'a dyn TranscriptAdapter,
    pub strategy: &'a str,
    /// Agent name used when the session did not record one.
    pub default_agent: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondenseOutcome {
    /// Work was written to the committed checkpoint.
    Condensed(CheckpointId),
    /// Nothing new in the transcript; only the base commit moved.
    Skipped,
}

/// The shadow branch a session currently writes to.
pub fn session_shadow_branch(state: &SessionState) -> String {
    shadow::shadow_branch_name(&state.base_commit, state.shadow_suffix.unwrap_or(1))
}

fn agent_name<'a>(ctx: &'a CondenseContext<'_>, state: &'a SessionState) -> &'a str {
    if state.agent.is_empty() {
        ctx.default_agent
    } else {
        &state.agent
    }
}

/// The session's transcript as of now: the live file when the agent told us
/// where it is, otherwise the copy in the latest temporary checkpoint.
pub fn live_transcript(ctx: &CondenseContext<'_>, state: &SessionState) -> EntireResult<Option<Vec<u8>>> {
    if let Some(path) = &state.transcript_path {
        match fs::read(path) {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "live transcript missing, using shadow copy");
            }
            Err(e) => return Err(e.into()),
        }
    }
    let branch = session_shadow_branch(state);
    let Some(latest) = temporary::latest_temporary(ctx.repo, &branch)? else {
        return Ok(None);
    };
    let oid = git2::Oid::from_str(&latest.commit)?;
    Ok(temporary::read_session_snapshot(ctx.repo, oid, &state.session_id)?.transcript)
}

/// True if another persisted session still builds on `branch`.
pub fn branch_needed_elsewhere(ctx: &CondenseContext<'_>, state: &SessionState, branch: &str) -> EntireResult<bool> {
    Ok(ctx.sessions.list()?.iter().any(|other| {
        other.session_id != state.session_id
            && other.worktree_id == state.worktree_id
            && other.base_commit == state.base_commit
            && other.step_count > 0
            && session_shadow_branch(other) == branch
    }))
}

/// Delete `branch` unless another session still needs it.
pub fn release_shadow_branch(ctx: &CondenseContext<'_>, state: &SessionState, branch: &str) -> EntireResult<bool> {
    if branch_needed_elsewhere(ctx, state, branch)? {
        tracing::debug!(branch, "shadow branch still used by another session");
        return Ok(false);
    }
    shadow::delete_shadow_branch(ctx.repo, branch)
}

/// Condense `state`'s shadow work into checkpoint `id`, linked to `head`.
///
/// On error `state` is left exactly as it was so the next commit retries.
pub fn condense_session(
    ctx: &CondenseContext<'_>,
    state: &mut SessionState,
    head: &Commit<'_>,
    id: &CheckpointId,
) -> EntireResult<CondenseOutcome> {
    let head_hash = head.id().to_string();
    let branch = session_shadow_branch(state);

    // Garbage on the shadow ref aborts before anything is written.
    if let Some(tip) = gitstore::branch_tip(ctx.repo, &branch)? {
        ctx.repo
            .find_commit(tip)
            .map_err(|e| EntireError::Corrupt(format!("{branch}: {}", e.message())))?;
    }

    let transcript = live_transcript(ctx, state)?.unwrap_or_default();
    let total = ctx.transcript.count_items(&transcript);
    let cursor = state.checkpoint_transcript_start;
    if total <= cursor {
        tracing::debug!(session = %state.session_id, "transcript unchanged since last checkpoint");
        state.base_commit = head_hash;
        return Ok(CondenseOutcome::Skipped);
    }

    let new_part = ctx.transcript.slice_from(&transcript, cursor);
    let prompts = ctx.transcript.extract_prompts(&new_part);
    let files: Vec<String> = state.files_touched.iter().cloned().collect();
    let store = CommittedStore::new(ctx.repo);

    let already_recorded = match store.read_committed(id) {
        Ok(meta) => meta.session_ids.iter().any(|s| s == &state.session_id),
        Err(EntireError::CheckpointNotFound(_)) => false,
        Err(e) => return Err(e),
    };

    if already_recorded {
        let existing = store.read_session_content(id, &state.session_id)?;
        let mut all_prompts = split_prompts(&existing.prompts);
        all_prompts.extend(prompts.iter().cloned());
        let mut all_files = existing.metadata.files_touched.clone();
        all_files.extend(files.iter().cloned());
        all_files.sort();
        all_files.dedup();
        let context = generate_context(&state.session_id, &all_prompts, &all_files);
        store.update_committed(&UpdateCommittedOptions {
            checkpoint_id: id,
            session_id: &state.session_id,
            transcript_append: &new_part,
            prompts: &prompts,
            context: &context,
        })?;
        if !files.is_empty() {
            store.merge_files_touched(id, &state.session_id, &files)?;
        }
    } else {
        let context = generate_context(&state.session_id, &prompts, &files);
        store.write_committed(&WriteCommittedOptions {
            checkpoint_id: id,
            session_id: &state.session_id,
            strategy: ctx.strategy,
            agent: agent_name(ctx, state),
            transcript: &transcript,
            prompts: &prompts,
            context: &context,
            files_touched: &files,
            transcript_start: cursor,
            checkpoints_count: state.step_count,
            summary: None,
        })?;
    }

    let mut next = state.clone();
    next.step_count = 0;
    next.files_touched.clear();
    next.last_checkpoint_id = Some(id.clone());
    next.pending_checkpoint_id = None;
    next.checkpoint_transcript_start = total;
    next.base_commit = head_hash;
    next.reset_shadow();

    match release_shadow_branch(ctx, state, &branch) {
        Ok(true) => tracing::debug!(branch = %branch, "deleted condensed shadow branch"),
        Ok(false) => {}
        Err(e) => tracing::warn!(branch = %branch, error = %e, "could not delete shadow branch"),
    }

    tracing::info!(
        session = %state.session_id,
        checkpoint = %id,
        files = files.len(),
        "condensed session"
    );
    *state = next;
    Ok(CondenseOutcome::Condensed(id.clone()))
}

/// Append conversation that happened after the last condensation to the
/// checkpoint it produced. Returns true if anything was appended.
///
/// Only applies once the session has a committed checkpoint and no newer
/// temporary work; the cursor moves forward so a second call is a no-op.
pub fn append_trailing_transcript(ctx: &CondenseContext<'_>, state: &mut SessionState) -> EntireResult<bool> {
    let Some(id) = state.last_checkpoint_id.clone() else {
        return Ok(false);
    };
    if state.step_count > 0 {
        return Ok(false);
    }
    let Some(path) = &state.transcript_path else {
        return Ok(false);
    };
    let transcript = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let total = ctx.transcript.count_items(&transcript);
    let cursor = state.checkpoint_transcript_start;
    if total <= cursor {
        return Ok(false);
    }

    let new_part = ctx.transcript.slice_from(&transcript, cursor);
    let prompts = ctx.transcript.extract_prompts(&new_part);
    let store = CommittedStore::new(ctx.repo);
    let existing = store.read_session_content(&id, &state.session_id)?;
    let mut all_prompts = split_prompts(&existing.prompts);
    all_prompts.extend(prompts.iter().cloned());
    let context = generate_context(&state.session_id, &all_prompts, &existing.metadata.files_touched);

    store.update_committed(&UpdateCommittedOptions {
        checkpoint_id: &id,
        session_id: &state.session_id,
        transcript_append: &new_part,
        prompts: &prompts,
        context: &context,
    })?;
    state.checkpoint_transcript_start = total;
    tracing::info!(session = %state.session_id, checkpoint = %id, items = total - cursor, "appended trailing transcript");
    Ok(true)
}
