//! The engine: one handle per hook invocation.
//!
//! [`Engine`] owns the repository, the effective settings and the session
//! store, and exposes every operation the CLI wires to agent and git hooks.
//! Nothing here is global; two engines on two repositories never interact.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{Commit, Oid, Repository};
use serde::{Deserialize, Serialize};

use crate::checkpoint::committed::{CommittedMetadata, CommittedStore, Summary, METADATA_BRANCH};
use crate::checkpoint::temporary::{self, TaskCheckpoint, TemporaryCheckpoint, WriteTemporaryOptions};
use crate::checkpoint::{join_prompts, session_metadata_dir, CONTEXT_FILE, PROMPT_FILE, TRANSCRIPT_FILE};
use crate::condense::{self, CondenseContext, CondenseOutcome};
use crate::error::{EntireError, EntireResult};
use crate::fsutil::{atomic_write, remove_empty_dirs, write_if_absent};
use crate::gitstore::{self, EntrySpec, MODE_BLOB_EXECUTABLE, MODE_LINK};
use crate::id::CheckpointId;
use crate::nav::{self, NavTree};
use crate::phase::{self, ActionHandler, Event, TransitionContext};
use crate::push::{self, FetchOutcome};
use crate::resolver;
use crate::session::{validate_session_id, Phase, SessionState, SessionStore};
use crate::settings::{Settings, ENTIRE_DIR};
use crate::shadow;
use crate::trailers;
use crate::transcript::{generate_context, JsonlTranscript, TranscriptAdapter};
use crate::worktree::{self, FileStatus};

/// Commits walked when looking for committed checkpoints in HEAD's history.
pub const MAX_HISTORY_SCAN: usize = 50;

/// Ended sessions older than this are forgotten at the next session start.
const ENDED_SESSION_RETENTION_DAYS: i64 = 7;

const ADMIN_GITIGNORE: &str = "metadata/\nsettings.local.json\n";

/// Payload agent hooks deliver on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookInput {
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
    /// Agent display name, e.g. "Claude Code".
    pub agent: Option<String>,
    pub agent_pid: Option<u32>,
    /// The user's prompt, on turn start.
    pub prompt: Option<String>,
}

impl HookInput {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }
}

/// A temporary checkpoint to record.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub modified_files: Vec<String>,
    pub new_files: Vec<String>,
    pub deleted_files: Vec<String>,
    /// Subagent task this checkpoint belongs to: tool-use ID and the
    /// directory holding its metadata.
    pub task: Option<(String, PathBuf)>,
    /// Subject line; a default is derived when empty.
    pub message: String,
}

impl SaveRequest {
    fn is_empty(&self) -> bool {
        self.modified_files.is_empty() && self.new_files.is_empty() && self.deleted_files.is_empty()
    }

    fn touched(&self) -> impl Iterator<Item = &String> {
        self.modified_files
            .iter()
            .chain(&self.new_files)
            .chain(&self.deleted_files)
    }
}

/// Produces a checkpoint summary, typically by asking an LLM.
pub trait SummaryGenerator {
    fn summarize(&self, transcript: &[u8], files_touched: &[String]) -> EntireResult<Summary>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RewindKind {
    Temporary,
    Committed,
}

/// A state the worktree can be rewound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewindPoint {
    pub kind: RewindKind,
    /// Shadow commit for temporary points, checkpoint ID for committed ones.
    pub id: String,
    /// Commit whose tree is restored.
    pub commit: String,
    pub session_id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewindReport {
    pub restored: Vec<String>,
    pub deleted: Vec<String>,
    pub transcript_restored: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub declined: bool,
    pub branches_deleted: Vec<String>,
    pub sessions_cleared: Vec<String>,
}

/// Sessions condensed by one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostCommitReport {
    pub condensed: Vec<(String, String)>,
    pub migrated: Vec<String>,
}

pub struct Engine {
    repo: Repository,
    root: PathBuf,
    settings: Settings,
    sessions: SessionStore,
    transcript: Box<dyn TranscriptAdapter>,
}

impl Engine {
    /// Discover the repository containing `path` and load its settings.
    pub fn open(path: &Path) -> EntireResult<Self> {
        let repo = gitstore::open_repo(path)?;
        let root = worktree::root(&repo)?;
        let settings = Settings::load(&root)?;
        let sessions = SessionStore::for_repo(&repo);
        Ok(Self {
            repo,
            root,
            settings,
            sessions,
            transcript: Box::new(JsonlTranscript),
        })
    }

    /// Use a different transcript format.
    pub fn with_transcript_adapter(mut self, adapter: Box<dyn TranscriptAdapter>) -> Self {
        self.transcript = adapter;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn ensure_enabled(&self) -> EntireResult<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(EntireError::Disabled)
        }
    }

    fn condense_ctx(&self) -> CondenseContext<'_> {
        CondenseContext {
            repo: &self.repo,
            sessions: &self.sessions,
            transcript: self.transcript.as_ref(),
            strategy: &self.settings.strategy,
            default_agent: &self.settings.agent,
        }
    }

    fn worktree_id(&self) -> String {
        worktree::worktree_id(&self.repo)
    }

    fn head_hash(&self) -> EntireResult<Option<String>> {
        Ok(gitstore::head_commit(&self.repo)?.map(|c| c.id().to_string()))
    }

    /// Sessions recorded for this worktree.
    pub fn worktree_sessions(&self) -> EntireResult<Vec<SessionState>> {
        let id = self.worktree_id();
        Ok(self
            .sessions
            .list()?
            .into_iter()
            .filter(|s| s.worktree_id == id)
            .collect())
    }

    fn load_or_create(&self, input: &HookInput) -> EntireResult<SessionState> {
        validate_session_id(&input.session_id)?;
        let mut state = match self.sessions.load(&input.session_id)? {
            Some(state) => state,
            None => {
                let head = self
                    .head_hash()?
                    .ok_or_else(|| EntireError::InvalidInput("repository has no commits yet".into()))?;
                let mut state = SessionState::new(&input.session_id, &head, &self.root, &self.worktree_id());
                state.agent = self.settings.agent.clone();
                tracing::debug!(session = %input.session_id, "new session");
                state
            }
        };
        if let Some(path) = &input.transcript_path {
            state.transcript_path = Some(path.clone());
        }
        if let Some(agent) = &input.agent {
            state.agent = agent.clone();
        }
        if let Some(pid) = input.agent_pid {
            state.agent_pid = pid;
        }
        Ok(state)
    }

    fn fire(&self, state: &mut SessionState, event: Event) -> EntireResult<PostCommitReport> {
        let ctx = TransitionContext {
            is_rebase_in_progress: gitstore::is_rebase_in_progress(&self.repo),
            has_files_touched: state.has_files_touched(),
        };
        let result = phase::transition(state.phase, event, ctx);
        let mut handler = CommitHandler {
            engine: self,
            head: gitstore::head_commit(&self.repo)?,
            report: PostCommitReport::default(),
        };
        phase::apply_transition(state, &result, &mut handler)?;
        Ok(handler.report)
    }

    // ---------------------------------------------------------------------
    // Agent hooks
    // ---------------------------------------------------------------------

    pub fn session_start(&self, input: &HookInput) -> EntireResult<SessionState> {
        self.ensure_enabled()?;
        match self
            .sessions
            .prune_ended(chrono::Duration::days(ENDED_SESSION_RETENTION_DAYS))
        {
            Ok(removed) if !removed.is_empty() => tracing::debug!(count = removed.len(), "pruned ended sessions"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not prune ended sessions"),
        }

        let mut state = self.load_or_create(input)?;
        if state.agent_pid == 0 {
            state.agent_pid = resolver::parent_pid(std::process::id()).unwrap_or(0);
        }
        self.fire(&mut state, Event::SessionStart)?;
        self.sessions.save(&state)?;
        Ok(state)
    }

    pub fn turn_start(&self, input: &HookInput) -> EntireResult<SessionState> {
        self.ensure_enabled()?;
        let mut state = self.load_or_create(input)?;

        if state.last_interaction_time.is_none() {
            state.untracked_files_at_start = worktree::untracked_files(&self.repo)?;
        }
        if state.first_prompt.is_none() {
            state.first_prompt = input.prompt.clone().filter(|p| !p.trim().is_empty());
        }
        if let Some(head) = self.head_hash()? {
            if state.base_commit != head && state.step_count == 0 {
                tracing::debug!(session = %state.session_id, "base commit moved while idle");
                state.base_commit = head;
                state.reset_shadow();
            }
        }

        self.fire(&mut state, Event::TurnStart)?;
        self.assign_suffix(&mut state)?;
        self.sessions.save(&state)?;
        Ok(state)
    }

    /// Record the turn's file changes, or append conversation to the last
    /// committed checkpoint when nothing changed.
    pub fn turn_end(&self, input: &HookInput) -> EntireResult<SessionState> {
        self.ensure_enabled()?;
        let mut state = self.load_or_create(input)?;

        let request = self.detect_changes(&state)?;
        let recorded = if request.is_empty() {
            None
        } else {
            self.record_checkpoint(&mut state, &request)?
        };
        if recorded.is_none() {
            self.append_trailing(&mut state);
        }

        let report = self.fire(&mut state, Event::TurnEnd)?;
        self.push_pending(&mut state, &report);
        self.sessions.save(&state)?;
        Ok(state)
    }

    pub fn session_stop(&self, input: &HookInput) -> EntireResult<Option<SessionState>> {
        self.ensure_enabled()?;
        validate_session_id(&input.session_id)?;
        let Some(mut state) = self.sessions.load(&input.session_id)? else {
            return Ok(None);
        };
        if let Some(path) = &input.transcript_path {
            state.transcript_path = Some(path.clone());
        }
        self.append_trailing(&mut state);
        self.fire(&mut state, Event::SessionStop)?;
        if state.phase == Phase::Ended {
            state.ended_at = Some(Utc::now());
        }
        self.sessions.save(&state)?;
        Ok(Some(state))
    }

    fn append_trailing(&self, state: &mut SessionState) {
        if let Err(e) = condense::append_trailing_transcript(&self.condense_ctx(), state) {
            tracing::warn!(session = %state.session_id, error = %e, "could not append trailing transcript");
        }
    }

    fn assign_suffix(&self, state: &mut SessionState) -> EntireResult<()> {
        let decision = shadow::determine_suffix(&self.repo, state)?;
        if state.shadow_suffix != Some(decision.suffix) {
            tracing::debug!(
                session = %state.session_id,
                suffix = decision.suffix,
                is_new = decision.is_new,
                "shadow suffix assigned"
            );
            if decision.is_new {
                state.checkpoint_count = 0;
            }
        }
        state.shadow_suffix = Some(decision.suffix);
        Ok(())
    }

    fn detect_changes(&self, state: &SessionState) -> EntireResult<SaveRequest> {
        let mut request = SaveRequest::default();
        for file in worktree::status(&self.repo)? {
            match file.status {
                FileStatus::New if state.untracked_files_at_start.contains(&file.path) => {}
                FileStatus::New => request.new_files.push(file.path),
                FileStatus::Modified => request.modified_files.push(file.path),
                FileStatus::Deleted => request.deleted_files.push(file.path),
            }
        }
        Ok(request)
    }

    // ---------------------------------------------------------------------
    // SaveChanges
    // ---------------------------------------------------------------------

    /// Record a temporary checkpoint for `session_id`.
    pub fn save_changes(&self, session_id: &str, request: &SaveRequest) -> EntireResult<Option<TemporaryCheckpoint>> {
        self.ensure_enabled()?;
        let mut state = self.load_or_create(&HookInput::new(session_id))?;
        let checkpoint = self.record_checkpoint(&mut state, request)?;
        self.sessions.save(&state)?;
        Ok(checkpoint)
    }

    fn record_checkpoint(&self, state: &mut SessionState, request: &SaveRequest) -> EntireResult<Option<TemporaryCheckpoint>> {
        if state.shadow_suffix.is_none() {
            self.assign_suffix(state)?;
        }
        let branch = condense::session_shadow_branch(state);

        let mut touched: BTreeSet<String> = state.files_touched.clone();
        touched.extend(request.touched().cloned());
        let metadata_dir = self.write_session_metadata(state, &touched)?;

        let modified: Vec<String> = request
            .modified_files
            .iter()
            .chain(&request.new_files)
            .cloned()
            .collect();
        let message = if request.message.trim().is_empty() {
            format!("Checkpoint {}", state.checkpoint_count + 1)
        } else {
            request.message.clone()
        };
        let task = request.task.as_ref().map(|(tool_use_id, dir)| TaskCheckpoint {
            tool_use_id: tool_use_id.as_str(),
            metadata_dir: dir.as_path(),
        });

        let written = temporary::write_temporary(
            &self.repo,
            &self.root,
            &WriteTemporaryOptions {
                session_id: &state.session_id,
                base_commit: &state.base_commit,
                branch: &branch,
                modified_files: &modified,
                deleted_files: &request.deleted_files,
                metadata_dir: Some(metadata_dir.as_path()),
                task,
                message: &message,
            },
        )?;

        if let Some(cp) = &written {
            state.step_count += 1;
            state.checkpoint_count += 1;
            state.files_touched = touched;
            tracing::info!(session = %state.session_id, branch = %cp.branch, step = state.step_count, "temporary checkpoint");
        }
        Ok(written)
    }

    /// Refresh `.entire/metadata/<session>/` on disk from the live transcript.
    fn write_session_metadata(&self, state: &SessionState, touched: &BTreeSet<String>) -> EntireResult<PathBuf> {
        let admin = self.root.join(ENTIRE_DIR);
        write_if_absent(&admin.join(".gitignore"), ADMIN_GITIGNORE.as_bytes())?;

        let dir = self.root.join(session_metadata_dir(&state.session_id));
        fs::create_dir_all(&dir)?;
        let transcript = match &state.transcript_path {
            Some(path) => match fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let prompts = match &transcript {
            Some(bytes) => {
                atomic_write(&dir.join(TRANSCRIPT_FILE), bytes)?;
                let since = self.transcript.slice_from(bytes, state.checkpoint_transcript_start);
                self.transcript.extract_prompts(&since)
            }
            None => Vec::new(),
        };
        let files: Vec<String> = touched.iter().cloned().collect();
        atomic_write(&dir.join(PROMPT_FILE), join_prompts(&prompts).as_bytes())?;
        atomic_write(
            &dir.join(CONTEXT_FILE),
            generate_context(&state.session_id, &prompts, &files).as_bytes(),
        )?;
        Ok(dir)
    }

    // ---------------------------------------------------------------------
    // Git hooks
    // ---------------------------------------------------------------------

    /// `prepare-commit-msg`: link the commit to uncondensed session work.
    ///
    /// Returns true if the message file was rewritten.
    pub fn prepare_commit_msg(&self, message_file: &Path, source: Option<&str>) -> EntireResult<bool> {
        if !self.settings.enabled {
            return Ok(false);
        }
        if matches!(source, Some("merge") | Some("squash")) {
            return Ok(false);
        }
        let message = fs::read_to_string(message_file)?;
        if trailers::checkpoint_id(&message).is_some() {
            return Ok(false);
        }
        let Some(head) = gitstore::head_commit(&self.repo)? else {
            return Ok(false);
        };
        let head_hash = head.id().to_string();
        let sessions = self.worktree_sessions()?;

        if source == Some("commit") {
            let restored = trailers::checkpoint_id(head.message().unwrap_or_default()).or_else(|| {
                sessions
                    .iter()
                    .find(|s| s.base_commit == head_hash && s.last_checkpoint_id.is_some())
                    .and_then(|s| s.last_checkpoint_id.clone())
            });
            if let Some(id) = restored {
                atomic_write(message_file, trailers::append(&message, trailers::CHECKPOINT, id.as_str()).as_bytes())?;
                tracing::debug!(checkpoint = %id, "restored checkpoint trailer on amend");
                return Ok(true);
            }
        }

        let ctx = self.condense_ctx();
        let mut candidates = Vec::new();
        for state in sessions.into_iter().filter(|s| s.base_commit == head_hash) {
            let grew = match condense::live_transcript(&ctx, &state) {
                Ok(t) => {
                    let items = t.map(|t| self.transcript.count_items(&t)).unwrap_or(0);
                    items > state.checkpoint_transcript_start
                }
                Err(e) => {
                    tracing::debug!(session = %state.session_id, error = %e, "transcript unreadable");
                    false
                }
            };
            if state.step_count > 0 || (grew && state.last_checkpoint_id.is_none()) {
                candidates.push(state);
            }
        }

        let owner = match candidates.len() {
            0 => return Ok(false),
            1 => &candidates[0],
            _ => match resolver::resolve_session(&candidates) {
                Some(owner) => owner,
                None => return Ok(false),
            },
        };
        let mut owner = owner.clone();
        let id = owner
            .pending_checkpoint_id
            .clone()
            .unwrap_or_else(|| CheckpointId::generate(&owner.session_id));
        owner.pending_checkpoint_id = Some(id.clone());
        self.sessions.save(&owner)?;

        atomic_write(message_file, trailers::append(&message, trailers::CHECKPOINT, id.as_str()).as_bytes())?;
        tracing::debug!(session = %owner.session_id, checkpoint = %id, "added checkpoint trailer");
        Ok(true)
    }

    /// `post-commit`: run the GitCommit transition for every session based on
    /// the new commit's parent. Condensation faults are logged, never raised.
    ///
    /// Commits replayed by a rebase change nothing.
    pub fn post_commit(&self) -> EntireResult<PostCommitReport> {
        let mut report = PostCommitReport::default();
        if !self.settings.enabled {
            return Ok(report);
        }
        if gitstore::is_rebase_in_progress(&self.repo) {
            tracing::debug!("rebase in progress, leaving sessions alone");
            return Ok(report);
        }
        let Some(head) = gitstore::head_commit(&self.repo)? else {
            return Ok(report);
        };

        for mut state in self.worktree_sessions()? {
            match self.commit_session(&mut state, &head, &mut report) {
                Ok(true) => self.sessions.save(&state)?,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session = %state.session_id, error = %e, "post-commit failed");
                }
            }
        }
        Ok(report)
    }

    /// Apply `head` to one session. Returns true if `state` changed and
    /// must be saved.
    fn commit_session(
        &self,
        state: &mut SessionState,
        head: &Commit<'_>,
        report: &mut PostCommitReport,
    ) -> EntireResult<bool> {
        let head_hash = head.id().to_string();
        let parent_hash = head.parent_id(0).ok().map(|p| p.to_string());
        let trailer_id = trailers::checkpoint_id(head.message().unwrap_or_default());

        if parent_hash.as_deref() == Some(state.base_commit.as_str()) {
            let r = self.fire(state, Event::GitCommit)?;
            report.condensed.extend(r.condensed);
            report.migrated.extend(r.migrated);
            self.push_pending(state, report);
            return Ok(true);
        }
        if trailer_id.is_some() && state.last_checkpoint_id == trailer_id && state.base_commit != head_hash {
            // Amended commit: follow the rewritten HEAD.
            let mut handler = CommitHandler {
                engine: self,
                head: gitstore::head_commit(&self.repo)?,
                report: PostCommitReport::default(),
            };
            handler.migrate(state)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// `pre-push`: share the metadata branch with `remote` when enabled.
    pub fn pre_push(&self, remote: &str, confirm: &dyn Fn(&str) -> bool) -> EntireResult<bool> {
        if !self.settings.enabled || !self.settings.push_sessions {
            return Ok(false);
        }
        if gitstore::branch_tip(&self.repo, METADATA_BRANCH)?.is_none() {
            return Ok(false);
        }
        if self.settings.ask_before_push && !confirm(&format!("Push session checkpoints to {remote}?")) {
            return Ok(false);
        }

        let pushed = push::push_metadata_branch(&self.root, remote);
        for mut state in self.worktree_sessions()? {
            let wanted = match &pushed {
                Ok(()) => None,
                Err(_) => Some(remote.to_string()),
            };
            if state.pending_push_remote != wanted {
                state.pending_push_remote = wanted;
                self.sessions.save(&state)?;
            }
        }
        match pushed {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(remote, error = %e, "checkpoint push failed, will retry after next commit");
                Ok(false)
            }
        }
    }

    fn push_pending(&self, state: &mut SessionState, report: &PostCommitReport) {
        let Some(remote) = state.pending_push_remote.clone() else {
            return;
        };
        if !report.condensed.iter().any(|(sid, _)| sid == &state.session_id) {
            return;
        }
        match push::push_metadata_branch(&self.root, &remote) {
            Ok(()) => state.pending_push_remote = None,
            Err(e) => tracing::warn!(remote = %remote, error = %e, "retrying checkpoint push failed"),
        }
    }

    /// Fetch the remote metadata branch.
    pub fn fetch(&self, remote: &str) -> EntireResult<FetchOutcome> {
        push::fetch_metadata_branch(&self.repo, &self.root, remote)
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Delete shadow branches and session state based on the current HEAD.
    pub fn reset(&self, force: bool, confirm: &dyn Fn(&str) -> bool) -> EntireResult<ResetReport> {
        self.ensure_enabled()?;
        let mut report = ResetReport::default();
        let Some(head) = self.head_hash()? else {
            return Ok(report);
        };
        let branches = shadow::branches_for_base(&self.repo, &head)?;
        let sessions: Vec<SessionState> = self
            .worktree_sessions()?
            .into_iter()
            .filter(|s| s.base_commit == head)
            .collect();
        if branches.is_empty() && sessions.is_empty() {
            return Ok(report);
        }

        let prompt = format!(
            "Delete {} shadow branch(es) and {} session(s) for {}?",
            branches.len(),
            sessions.len(),
            gitstore::short_hash(&head)
        );
        if !force && !confirm(&prompt) {
            report.declined = true;
            return Ok(report);
        }

        for branch in branches {
            if shadow::delete_shadow_branch(&self.repo, &branch)? {
                report.branches_deleted.push(branch);
            }
        }
        let admin = self.root.join(ENTIRE_DIR);
        for state in sessions {
            let dir = self.root.join(session_metadata_dir(&state.session_id));
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                if let Some(parent) = dir.parent() {
                    remove_empty_dirs(parent, &admin)?;
                }
            }
            if self.sessions.delete(&state.session_id)? {
                report.sessions_cleared.push(state.session_id);
            }
        }
        tracing::info!(
            branches = report.branches_deleted.len(),
            sessions = report.sessions_cleared.len(),
            "reset"
        );
        Ok(report)
    }

    /// Points the worktree can be rewound to, newest first.
    pub fn rewind_points(&self, limit: usize) -> EntireResult<Vec<RewindPoint>> {
        let mut points = Vec::new();
        let head = gitstore::head_commit(&self.repo)?;
        let head_hash = head.as_ref().map(|c| c.id().to_string()).unwrap_or_default();

        let mut seen = BTreeSet::new();
        for state in self.worktree_sessions()? {
            if state.base_commit != head_hash {
                continue;
            }
            let branch = condense::session_shadow_branch(&state);
            if !seen.insert(branch.clone()) {
                continue;
            }
            for cp in temporary::list_temporary(&self.repo, &branch, limit)? {
                points.push(RewindPoint {
                    kind: RewindKind::Temporary,
                    id: cp.commit.clone(),
                    commit: cp.commit,
                    session_id: cp.session_id,
                    label: cp.subject,
                    created_at: cp.created_at,
                });
            }
        }

        let store = CommittedStore::new(&self.repo);
        let mut cursor = head;
        let mut scanned = 0;
        while let Some(commit) = cursor {
            if scanned >= MAX_HISTORY_SCAN {
                break;
            }
            scanned += 1;
            if let Some(id) = trailers::checkpoint_id(commit.message().unwrap_or_default()) {
                match store.read_committed(&id) {
                    Ok(meta) => points.push(RewindPoint {
                        kind: RewindKind::Committed,
                        id: id.to_string(),
                        commit: commit.id().to_string(),
                        session_id: meta.session_ids.first().cloned().unwrap_or_default(),
                        label: commit.summary().unwrap_or_default().to_string(),
                        created_at: meta.created_at,
                    }),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            cursor = commit.parent(0).ok();
        }

        points.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        points.truncate(limit);
        Ok(points)
    }

    /// Restore the worktree to `point`.
    pub fn rewind(&self, point: &RewindPoint) -> EntireResult<RewindReport> {
        self.ensure_enabled()?;
        let oid = Oid::from_str(&point.commit)
            .map_err(|_| EntireError::InvalidInput(format!("bad commit: {}", point.commit)))?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|e| EntireError::Corrupt(format!("{}: {}", point.commit, e.message())))?;
        let files: Vec<(String, EntrySpec)> = gitstore::tree_files(&commit.tree()?)?
            .into_iter()
            .filter(|(path, _)| !worktree::is_admin_path(path))
            .collect();

        let mut report = RewindReport::default();
        let state = validate_session_id(&point.session_id)
            .ok()
            .and_then(|_| self.sessions.load(&point.session_id).ok().flatten());

        if point.kind == RewindKind::Temporary {
            if temporary::read_temporary(&self.repo, oid, "")?.is_none() {
                return Err(EntireError::InvalidInput(format!("{} is not a checkpoint", point.commit)));
            }
            let keep: BTreeSet<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
            let protected = state
                .as_ref()
                .map(|s| s.untracked_files_at_start.clone())
                .unwrap_or_default();
            let mut doomed: BTreeSet<String> = worktree::status(&self.repo)?
                .into_iter()
                .filter(|f| f.status == FileStatus::New)
                .map(|f| f.path)
                .filter(|p| !protected.contains(p))
                .collect();
            if let Some(head) = gitstore::head_commit(&self.repo)? {
                doomed.extend(gitstore::tree_files(&head.tree()?)?.into_keys());
            }
            for path in doomed {
                if keep.contains(path.as_str()) || worktree::is_admin_path(&path) {
                    continue;
                }
                let full = self.root.join(&path);
                if fs::symlink_metadata(&full).is_ok() {
                    fs::remove_file(&full)?;
                    if let Some(parent) = full.parent() {
                        remove_empty_dirs(parent, &self.root)?;
                    }
                    report.deleted.push(path);
                }
            }
        }

        for (path, spec) in &files {
            self.restore_file(path, spec)?;
            report.restored.push(path.clone());
        }

        let transcript = match point.kind {
            RewindKind::Temporary => {
                temporary::read_session_snapshot(&self.repo, oid, &point.session_id)?.transcript
            }
            RewindKind::Committed => {
                let id: CheckpointId = point.id.parse()?;
                Some(CommittedStore::new(&self.repo).read_session_content(&id, &point.session_id)?.transcript)
            }
        };
        if let (Some(bytes), Some(path)) = (transcript, state.as_ref().and_then(|s| s.transcript_path.as_ref())) {
            atomic_write(path, &bytes)?;
            report.transcript_restored = true;
        }

        tracing::info!(
            point = %point.id,
            restored = report.restored.len(),
            deleted = report.deleted.len(),
            "rewound worktree"
        );
        Ok(report)
    }

    fn restore_file(&self, path: &str, spec: &EntrySpec) -> EntireResult<()> {
        let full = self.root.join(path);
        let blob = self
            .repo
            .find_blob(spec.oid)
            .map_err(|e| EntireError::Corrupt(format!("{path}: {}", e.message())))?;

        if spec.mode == MODE_LINK {
            #[cfg(unix)]
            {
                if fs::symlink_metadata(&full).is_ok() {
                    fs::remove_file(&full)?;
                }
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                let target = String::from_utf8_lossy(blob.content()).to_string();
                std::os::unix::fs::symlink(target, &full)?;
            }
            return Ok(());
        }

        if fs::symlink_metadata(&full).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&full)?;
        }
        atomic_write(&full, blob.content())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if spec.mode == MODE_BLOB_EXECUTABLE { 0o755 } else { 0o644 };
            fs::set_permissions(&full, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    pub fn checkpoints(&self) -> EntireResult<Vec<CommittedMetadata>> {
        CommittedStore::new(&self.repo).list_committed()
    }

    pub fn checkpoint(&self, id: &CheckpointId) -> EntireResult<CommittedMetadata> {
        CommittedStore::new(&self.repo).read_committed(id)
    }

    /// Generate and store a summary for checkpoint `id`.
    pub fn summarize(&self, id: &CheckpointId, generator: &dyn SummaryGenerator) -> EntireResult<Summary> {
        let store = CommittedStore::new(&self.repo);
        let meta = store.read_committed(id)?;
        let mut transcript = Vec::new();
        for sid in &meta.session_ids {
            let content = store.read_session_content(id, sid)?;
            transcript.extend(
                self.transcript
                    .slice_from(&content.transcript, content.metadata.transcript_start),
            );
        }
        let summary = generator.summarize(&transcript, &meta.files_touched)?;
        store.update_summary(id, summary.clone())?;
        Ok(summary)
    }

    pub fn navigation_tree(&self) -> EntireResult<NavTree> {
        nav::build_navigation_tree(&self.repo)
    }
}

/// Runs phase-machine actions against the repository for one HEAD.
struct CommitHandler<'e> {
    engine: &'e Engine,
    head: Option<Commit<'e>>,
    report: PostCommitReport,
}

impl CommitHandler<'_> {
    fn condense(&mut self, state: &mut SessionState) -> EntireResult<()> {
        let Some(head) = self.head.clone() else {
            return Ok(());
        };
        let engine = self.engine;
        let id = trailers::checkpoint_id(head.message().unwrap_or_default())
            .or_else(|| state.pending_checkpoint_id.clone());
        let Some(id) = id else {
            tracing::debug!(session = %state.session_id, "commit carries no checkpoint, moving shadow branch");
            return self.migrate(state);
        };

        let chosen = state.pending_checkpoint_id.as_ref() == Some(&id);
        let branch = condense::session_shadow_branch(state);
        let overlaps = state.has_files_touched()
            && shadow::files_overlap_with_content(&engine.repo, &head, &state.files_touched, &branch);
        if !chosen && !overlaps {
            tracing::debug!(session = %state.session_id, "commit does not contain session work");
            return self.migrate(state);
        }

        match condense::condense_session(&engine.condense_ctx(), state, &head, &id) {
            Ok(CondenseOutcome::Condensed(id)) => {
                self.report.condensed.push((state.session_id.clone(), id.to_string()));
            }
            Ok(CondenseOutcome::Skipped) => {}
            Err(e) => {
                tracing::warn!(session = %state.session_id, checkpoint = %id, error = %e, "condensation failed, will retry");
            }
        }
        Ok(())
    }

    /// Move the session (and its shadow branch) onto HEAD.
    fn migrate(&mut self, state: &mut SessionState) -> EntireResult<()> {
        let Some(head) = &self.head else {
            return Ok(());
        };
        let head_hash = head.id().to_string();
        if state.base_commit == head_hash {
            return Ok(());
        }
        let repo = &self.engine.repo;
        let from = condense::session_shadow_branch(state);

        if gitstore::branch_tip(repo, &from)?.is_some() {
            let current = state.shadow_suffix.unwrap_or(1);
            let target = if gitstore::branch_tip(repo, &shadow::shadow_branch_name(&head_hash, current))?.is_none() {
                Some(current)
            } else {
                shadow::next_free_suffix(repo, &head_hash, current)?
            };
            let Some(target) = target else {
                tracing::warn!(branch = %from, "no free shadow suffix on new HEAD, leaving branch in place");
                return Ok(());
            };
            let keep_source = condense::branch_needed_elsewhere(&self.engine.condense_ctx(), state, &from)?;
            shadow::rename_shadow_branch(repo, &from, &shadow::shadow_branch_name(&head_hash, target), keep_source)?;
            state.shadow_suffix = Some(target);
        } else {
            state.reset_shadow();
        }
        state.base_commit = head_hash;
        self.report.migrated.push(state.session_id.clone());
        Ok(())
    }
}

impl ActionHandler for CommitHandler<'_> {
    fn handle_condense(&mut self, state: &mut SessionState) -> EntireResult<()> {
        self.condense(state)
    }

    fn handle_condense_if_files_touched(&mut self, state: &mut SessionState) -> EntireResult<()> {
        if state.has_files_touched() {
            self.condense(state)
        } else {
            Ok(())
        }
    }

    fn handle_discard_if_no_files(&mut self, state: &mut SessionState) -> EntireResult<()> {
        if state.has_files_touched() {
            return Ok(());
        }
        let Some(head) = &self.head else {
            return Ok(());
        };
        let branch = condense::session_shadow_branch(state);
        if let Err(e) = condense::release_shadow_branch(&self.engine.condense_ctx(), state, &branch) {
            tracing::warn!(branch = %branch, error = %e, "could not delete shadow branch");
        }
        state.base_commit = head.id().to_string();
        state.step_count = 0;
        state.reset_shadow();
        Ok(())
    }

    fn handle_migrate_shadow_branch(&mut self, state: &mut SessionState) -> EntireResult<()> {
        if let Err(e) = self.migrate(state) {
            tracing::warn!(session = %state.session_id, error = %e, "could not move shadow branch");
        }
        Ok(())
    }

    fn handle_warn_stale_session(&mut self, state: &mut SessionState) -> EntireResult<()> {
        tracing::warn!(
            session = %state.session_id,
            phase = %state.phase,
            "session started again while a turn was still active"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitstore::testutil::{commit_files, commit_on_branch, init_repo};
    use tempfile::{tempdir, TempDir};

    const PROMPT1: &str = "{\"type\":\"user\",\"message\":{\"content\":\"create app.py\"}}\n";
    const REPLY1: &str = "{\"type\":\"assistant\",\"message\":{\"content\":\"created\"}}\n";
    const PROMPT2: &str = "{\"type\":\"user\",\"message\":{\"content\":\"explain it\"}}\n";
    const REPLY2: &str = "{\"type\":\"assistant\",\"message\":{\"content\":\"it prints\"}}\n";

    struct Fixture {
        dir: TempDir,
        transcripts: TempDir,
        engine: Engine,
        base: Oid,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let repo = init_repo(dir.path());
            let base = commit_files(&repo, &[("README.md", "hello\n")], "init");
            let engine = Engine::open(dir.path()).unwrap();
            Fixture {
                dir,
                transcripts: tempdir().unwrap(),
                engine,
                base,
            }
        }

        fn input(&self, sid: &str) -> HookInput {
            HookInput {
                session_id: sid.to_string(),
                transcript_path: Some(self.transcripts.path().join(format!("{sid}.jsonl"))),
                agent: Some("Claude Code".into()),
                agent_pid: Some(0),
                prompt: None,
            }
        }

        fn write_transcript(&self, sid: &str, lines: &[&str]) {
            fs::write(self.transcripts.path().join(format!("{sid}.jsonl")), lines.concat()).unwrap();
        }

        fn write(&self, path: &str, content: &str) {
            fs::write(self.dir.path().join(path), content).unwrap();
        }

        /// Run prepare-commit-msg, then commit exactly `paths`.
        fn commit(&self, paths: &[&str], subject: &str) -> Oid {
            let msg_file = self.dir.path().join(".git/COMMIT_EDITMSG");
            fs::write(&msg_file, format!("{subject}\n")).unwrap();
            self.engine.prepare_commit_msg(&msg_file, Some("message")).unwrap();
            let message = fs::read_to_string(&msg_file).unwrap();

            let repo = self.engine.repo();
            let mut index = repo.index().unwrap();
            for p in paths {
                index.add_path(Path::new(p)).unwrap();
            }
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = repo.signature().unwrap();
            let parent = repo.head().unwrap().peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent]).unwrap()
        }

        fn state(&self, sid: &str) -> SessionState {
            self.engine.sessions().load(sid).unwrap().unwrap()
        }
    }

    #[test]
    fn test_end_to_end_checkpoint_then_condense() {
        let fx = Fixture::new();
        let b = fx.base.to_string();
        fx.engine.session_start(&fx.input("s1")).unwrap();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "print('hi')\n");
        fx.write_transcript("s1", &[PROMPT1, REPLY1]);
        let state = fx.engine.turn_end(&fx.input("s1")).unwrap();

        let shadow = shadow::shadow_branch_name(&b, 1);
        assert!(gitstore::branch_tip(fx.engine.repo(), &shadow).unwrap().is_some());
        assert_eq!(state.step_count, 1);
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.files_touched.contains("app.py"));

        let head = fx.commit(&["app.py"], "Add app");
        let message = fx.engine.repo().find_commit(head).unwrap().message().unwrap().to_string();
        let id = trailers::checkpoint_id(&message).expect("trailer added");

        let report = fx.engine.post_commit().unwrap();
        assert_eq!(report.condensed, vec![("s1".to_string(), id.to_string())]);

        let meta = fx.engine.checkpoint(&id).unwrap();
        assert_eq!(meta.files_touched, vec!["app.py"]);
        assert_eq!(meta.agent, "Claude Code");
        assert!(gitstore::branch_tip(fx.engine.repo(), &shadow).unwrap().is_none());

        let state = fx.state("s1");
        assert_eq!(state.step_count, 0);
        assert!(state.files_touched.is_empty());
        assert_eq!(state.base_commit, head.to_string());
        assert_eq!(state.last_checkpoint_id, Some(id));
    }

    #[test]
    fn test_end_to_end_trailing_conversation_appends() {
        let fx = Fixture::new();
        fx.engine.session_start(&fx.input("s1")).unwrap();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "print('hi')\n");
        fx.write_transcript("s1", &[PROMPT1, REPLY1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();
        fx.commit(&["app.py"], "Add app");
        fx.engine.post_commit().unwrap();
        let id = fx.state("s1").last_checkpoint_id.unwrap();

        // Conversation only, no file edits.
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write_transcript("s1", &[PROMPT1, REPLY1, PROMPT2, REPLY2]);
        let state = fx.engine.turn_end(&fx.input("s1")).unwrap();
        assert_eq!(state.checkpoint_transcript_start, 4);
        assert_eq!(state.step_count, 0);

        let store = CommittedStore::new(fx.engine.repo());
        let content = store.read_session_content(&id, "s1").unwrap();
        assert_eq!(content.transcript, [PROMPT1, REPLY1, PROMPT2, REPLY2].concat().into_bytes());
        assert_eq!(content.prompts, "create app.py\n\n---\n\nexplain it");
        assert_eq!(fx.engine.checkpoints().unwrap().len(), 1);

        // A second call site sees nothing new.
        let before = store.read_session_content(&id, "s1").unwrap();
        fx.engine.session_stop(&fx.input("s1")).unwrap();
        assert_eq!(store.read_session_content(&id, "s1").unwrap(), before);
        assert_eq!(fx.state("s1").phase, Phase::Ended);
    }

    #[test]
    fn test_prepare_commit_msg_sources() {
        let fx = Fixture::new();
        let msg = fx.dir.path().join("MSG");

        // No session work: message untouched.
        fs::write(&msg, "Plain\n").unwrap();
        assert!(!fx.engine.prepare_commit_msg(&msg, Some("message")).unwrap());

        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.write_transcript("s1", &[PROMPT1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();

        assert!(!fx.engine.prepare_commit_msg(&msg, Some("merge")).unwrap());
        assert!(fx.engine.prepare_commit_msg(&msg, Some("message")).unwrap());
        let first = trailers::checkpoint_id(&fs::read_to_string(&msg).unwrap()).unwrap();
        // Existing trailer is left alone.
        assert!(!fx.engine.prepare_commit_msg(&msg, Some("message")).unwrap());

        // A retried commit reuses the pending ID.
        fs::write(&msg, "Again\n").unwrap();
        fx.engine.prepare_commit_msg(&msg, None).unwrap();
        assert_eq!(trailers::checkpoint_id(&fs::read_to_string(&msg).unwrap()), Some(first));
    }

    #[test]
    fn test_amend_restores_trailer() {
        let fx = Fixture::new();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.write_transcript("s1", &[PROMPT1, REPLY1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();
        fx.commit(&["app.py"], "Add app");
        fx.engine.post_commit().unwrap();
        let id = fx.state("s1").last_checkpoint_id.unwrap();

        let msg = fx.dir.path().join("MSG");
        fs::write(&msg, "Add app, reworded\n").unwrap();
        assert!(fx.engine.prepare_commit_msg(&msg, Some("commit")).unwrap());
        assert_eq!(trailers::checkpoint_id(&fs::read_to_string(&msg).unwrap()), Some(id));
    }

    #[test]
    fn test_unrelated_commit_moves_session_without_condensing() {
        let fx = Fixture::new();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.write_transcript("s1", &[PROMPT1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();

        // The user commits an unrelated file without a trailer.
        fx.write("notes.txt", "n\n");
        let repo = fx.engine.repo();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("notes.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = repo.signature().unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let head = repo.commit(Some("HEAD"), &sig, &sig, "notes", &tree, &[&parent]).unwrap();

        let report = fx.engine.post_commit().unwrap();
        assert!(report.condensed.is_empty());
        assert_eq!(report.migrated, vec!["s1"]);
        let state = fx.state("s1");
        assert_eq!(state.base_commit, head.to_string());
        assert_eq!(state.step_count, 1);
        let moved = shadow::shadow_branch_name(&head.to_string(), 1);
        assert!(gitstore::branch_tip(repo, &moved).unwrap().is_some());
        assert!(fx.engine.checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_rewind_to_temporary_checkpoint() {
        let fx = Fixture::new();
        fx.write("keep.txt", "mine\n");
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "v1\n");
        fx.write_transcript("s1", &[PROMPT1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();

        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "v2\n");
        fx.write("scratch.py", "tmp\n");
        fx.engine.turn_end(&fx.input("s1")).unwrap();

        let points = fx.engine.rewind_points(10).unwrap();
        assert_eq!(points.len(), 2);
        let oldest = points
            .iter()
            .find(|p| p.label == "Checkpoint 1")
            .expect("first checkpoint listed")
            .clone();
        let report = fx.engine.rewind(&oldest).unwrap();

        assert_eq!(fs::read_to_string(fx.dir.path().join("app.py")).unwrap(), "v1\n");
        assert!(!fx.dir.path().join("scratch.py").exists());
        assert_eq!(fs::read_to_string(fx.dir.path().join("keep.txt")).unwrap(), "mine\n");
        assert_eq!(report.deleted, vec!["scratch.py"]);
        assert!(report.transcript_restored);
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let fx = Fixture::new();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.engine.turn_end(&fx.input("s1")).unwrap();

        let report = fx.engine.reset(false, &|_| false).unwrap();
        assert!(report.declined);
        assert!(fx.engine.sessions().load("s1").unwrap().is_some());

        let report = fx.engine.reset(false, &|_| true).unwrap();
        assert_eq!(report.sessions_cleared, vec!["s1"]);
        assert_eq!(report.branches_deleted, vec![shadow::shadow_branch_name(&fx.base.to_string(), 1)]);
        assert!(fx.engine.sessions().load("s1").unwrap().is_none());
        assert!(!fx.dir.path().join(".entire/metadata/s1").exists());
    }

    struct FixedSummary;

    impl SummaryGenerator for FixedSummary {
        fn summarize(&self, transcript: &[u8], files: &[String]) -> EntireResult<Summary> {
            assert!(!transcript.is_empty());
            Ok(Summary {
                intent: "Create app".into(),
                outcome: format!("{} file(s)", files.len()),
                learnings: vec![],
                friction: vec![],
            })
        }
    }

    #[test]
    fn test_summarize_and_navigation_tree() {
        let fx = Fixture::new();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.write_transcript("s1", &[PROMPT1, REPLY1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();
        fx.commit(&["app.py"], "Add app");
        fx.engine.post_commit().unwrap();
        let id = fx.state("s1").last_checkpoint_id.unwrap();

        let summary = fx.engine.summarize(&id, &FixedSummary).unwrap();
        assert_eq!(summary.outcome, "1 file(s)");
        assert_eq!(fx.engine.checkpoint(&id).unwrap().summary, Some(summary));

        let tree = fx.engine.navigation_tree().unwrap();
        assert_eq!(tree.children(tree.root()).len(), 1);

        let points = fx.engine.rewind_points(10).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].kind, RewindKind::Committed);
    }

    #[test]
    fn test_disabled_engine_refuses_hooks() {
        let fx = Fixture::new();
        let settings = Settings {
            enabled: false,
            ..Settings::default()
        };
        let engine = Engine::open(fx.dir.path()).unwrap().with_settings(settings);
        assert!(matches!(engine.turn_start(&fx.input("s1")), Err(EntireError::Disabled)));
        assert!(engine.post_commit().unwrap().condensed.is_empty());
    }

    #[test]
    fn test_post_commit_ignores_rebase_replays() {
        let fx = Fixture::new();
        fx.engine.session_start(&fx.input("s1")).unwrap();
        fx.engine.turn_start(&fx.input("s1")).unwrap();
        fx.write("app.py", "x\n");
        fx.write_transcript("s1", &[PROMPT1, REPLY1]);
        fx.engine.turn_end(&fx.input("s1")).unwrap();
        let condensed = fx.commit(&["app.py"], "Add app");
        fx.engine.post_commit().unwrap();
        let before = fx.state("s1");
        assert_eq!(before.base_commit, condensed.to_string());

        // Replay the condensed commit, trailer included, onto another parent.
        fs::create_dir_all(fx.dir.path().join(".git/rebase-merge")).unwrap();
        let repo = fx.engine.repo();
        let original = repo.find_commit(condensed).unwrap();
        let onto = repo.find_commit(fx.base).unwrap();
        let sig = repo.signature().unwrap();
        let replayed = repo
            .commit(None, &sig, &sig, original.message().unwrap(), &original.tree().unwrap(), &[&onto])
            .unwrap();
        repo.set_head_detached(replayed).unwrap();

        let report = fx.engine.post_commit().unwrap();
        assert_eq!(report, PostCommitReport::default());
        let after = fx.state("s1");
        assert_eq!(after.base_commit, before.base_commit);
        assert_eq!(after.shadow_suffix, before.shadow_suffix);
        assert_eq!(after.phase, before.phase);
    }

    #[test]
    fn test_failing_session_does_not_block_others() {
        let fx = Fixture::new();
        let repo = fx.engine.repo();
        let base = fx.base.to_string();
        let wt = worktree::worktree_id(repo);
        let id: CheckpointId = "a1b2c3d4e5f6".parse().unwrap();

        // s1: unrelated work that will have to move to the new HEAD.
        let mut s1 = SessionState::new("s1", &base, fx.engine.root(), &wt);
        s1.shadow_suffix = Some(1);
        s1.step_count = 1;
        s1.touch_files(["notes.txt"]);
        commit_on_branch(repo, &shadow::shadow_branch_name(&base, 1), fx.base, &[("notes.txt", "n\n")]);
        fx.engine.sessions().save(&s1).unwrap();

        // s2: owns the checkpoint the commit carries.
        let mut s2 = SessionState::new("s2", &base, fx.engine.root(), &wt);
        s2.shadow_suffix = Some(2);
        s2.step_count = 1;
        s2.touch_files(["app.py"]);
        s2.pending_checkpoint_id = Some(id.clone());
        s2.transcript_path = Some(fx.transcripts.path().join("s2.jsonl"));
        fx.write_transcript("s2", &[PROMPT1, REPLY1]);
        commit_on_branch(repo, &shadow::shadow_branch_name(&base, 2), fx.base, &[("app.py", "x\n")]);
        fx.engine.sessions().save(&s2).unwrap();

        fx.write("app.py", "x\n");
        let head = fx.commit(&["app.py"], &trailers::append("Add app", trailers::CHECKPOINT, id.as_str()));

        // A directory under s1's target branch name makes its move fail.
        let blocked = gitstore::branch_ref(&shadow::shadow_branch_name(&head.to_string(), 1));
        repo.reference(&format!("{blocked}/held"), head, false, "test").unwrap();

        let report = fx.engine.post_commit().unwrap();
        assert_eq!(report.condensed, vec![("s2".to_string(), id.to_string())]);
        assert_eq!(fx.state("s2").step_count, 0);
        assert_eq!(fx.state("s2").base_commit, head.to_string());
        assert!(fx.engine.checkpoint(&id).is_ok());

        let s1_after = fx.state("s1");
        assert_eq!(s1_after.base_commit, base);
        assert_eq!(s1_after.step_count, 1);
    }
}
