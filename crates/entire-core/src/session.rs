//! Per-session state persisted outside tracked history.
//!
//! Each agent session owns one JSON file under
//! `<git common dir>/entire-sessions/<session-id>.json`. Hook invocations for
//! a session only ever read and write that session's file, so concurrent
//! sessions in the same clone never contend on state.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{EntireError, EntireResult};
use crate::fsutil::{atomic_write, write_if_absent};
use crate::id::CheckpointId;
use crate::migrate;

/// Directory name under the git common dir.
pub const SESSIONS_DIR: &str = "entire-sessions";

const README: &str = "\
# entire sessions

This directory holds per-session state for entire's agent checkpoints.
One JSON file per agent session. Files are created and updated by git and
agent hooks; they are not part of your repository history.

Deleting a file here forgets that session (`entire reset` does this for you).
";

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Idle,
    Active,
    ActiveCommitted,
    Ended,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Idle, Phase::Active, Phase::ActiveCommitted, Phase::Ended];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Active => "active",
            Phase::ActiveCommitted => "active_committed",
            Phase::Ended => "ended",
        }
    }

    /// Parse a stored phase. Empty and unknown strings mean `Idle`, which is
    /// how state files written before phases existed are read.
    pub fn parse(s: &str) -> Phase {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Phase::Active,
            "active_committed" => Phase::ActiveCommitted,
            "ended" => Phase::Ended,
            _ => Phase::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| Phase::parse(&s)).unwrap_or_default())
    }
}

/// Mutable state of one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// Commit the session's shadow branch is based on.
    pub base_commit: String,
    #[serde(default)]
    pub worktree_path: String,
    /// Linked-worktree name; empty for the main worktree.
    #[serde(default)]
    pub worktree_id: String,
    #[serde(default)]
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    /// Agent display name, e.g. "Claude Code".
    #[serde(default)]
    pub agent: String,
    /// Temporary checkpoints since the last condensation.
    #[serde(default)]
    pub step_count: u32,
    /// Temporary checkpoints recorded on the current shadow lineage.
    #[serde(default)]
    pub checkpoint_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_suffix: Option<u32>,
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<CheckpointId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint_id: Option<CheckpointId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_push_remote: Option<String>,
    /// Transcript items already folded into committed checkpoints.
    #[serde(default)]
    pub checkpoint_transcript_start: usize,
    /// OS process ID of the agent; 0 when unknown.
    #[serde(default)]
    pub agent_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    /// Untracked files that existed before the first turn; rewind keeps them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub untracked_files_at_start: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(session_id: &str, base_commit: &str, worktree_path: &Path, worktree_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            base_commit: base_commit.to_string(),
            worktree_path: worktree_path.to_string_lossy().to_string(),
            worktree_id: worktree_id.to_string(),
            phase: Phase::Idle,
            started_at: Utc::now(),
            agent: String::new(),
            step_count: 0,
            checkpoint_count: 0,
            shadow_suffix: None,
            files_touched: BTreeSet::new(),
            last_checkpoint_id: None,
            pending_checkpoint_id: None,
            pending_push_remote: None,
            checkpoint_transcript_start: 0,
            agent_pid: 0,
            transcript_path: None,
            untracked_files_at_start: BTreeSet::new(),
            first_prompt: None,
            last_interaction_time: None,
            ended_at: None,
        }
    }

    pub fn has_files_touched(&self) -> bool {
        !self.files_touched.is_empty()
    }

    pub fn touch_files<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_touched.extend(files.into_iter().map(Into::into));
    }

    /// Forget the shadow lineage, e.g. after the base commit moved.
    pub fn reset_shadow(&mut self) {
        self.shadow_suffix = None;
        self.checkpoint_count = 0;
    }
}

/// Validate a session ID before it is used as a file name.
pub fn validate_session_id(id: &str) -> EntireResult<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(EntireError::InvalidInput(format!(
            "session ID must be 1-128 chars, got {}",
            id.len()
        )));
    }
    if id.starts_with('.')
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
    {
        return Err(EntireError::InvalidInput(format!(
            "session ID contains invalid characters: {id}"
        )));
    }
    Ok(())
}

/// Loads and saves [`SessionState`] files.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Store shared by every worktree of `repo`.
    pub fn for_repo(repo: &git2::Repository) -> Self {
        Self::new(&crate::gitstore::common_dir(repo).join(SESSIONS_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Load a session, applying legacy migrations. `None` if absent.
    pub fn load(&self, session_id: &str) -> EntireResult<Option<SessionState>> {
        validate_session_id(session_id)?;
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_file(&path).map(Some)
    }

    fn read_file(path: &Path) -> EntireResult<SessionState> {
        let data = fs::read_to_string(path)?;
        let mut raw: Value = serde_json::from_str(&data)?;
        migrate::migrate_session_json(&mut raw);
        Ok(serde_json::from_value(raw)?)
    }

    /// Persist a session. Creates the directory README on first use.
    pub fn save(&self, state: &SessionState) -> EntireResult<()> {
        validate_session_id(&state.session_id)?;
        fs::create_dir_all(&self.dir)?;
        write_if_absent(&self.dir.join("README.md"), README.as_bytes())?;
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path_for(&state.session_id), json.as_bytes())
    }

    /// Remove a session's file. Returns whether it existed.
    pub fn delete(&self, session_id: &str) -> EntireResult<bool> {
        validate_session_id(session_id)?;
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    /// All readable sessions, sorted by session ID. Unreadable files are
    /// skipped with a warning rather than failing the hook.
    pub fn list(&self) -> EntireResult<Vec<SessionState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(state) => sessions.push(state),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session state"),
            }
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    /// Delete ended sessions with nothing left to condense whose end is
    /// older than `max_age`. Returns the removed IDs.
    pub fn prune_ended(&self, max_age: Duration) -> EntireResult<Vec<String>> {
        let cutoff = Utc::now() - max_age;
        let mut removed = Vec::new();
        for state in self.list()? {
            let abandoned = state.phase == Phase::Ended
                && state.step_count == 0
                && state.ended_at.is_some_and(|t| t < cutoff);
            if abandoned && self.delete(&state.session_id)? {
                removed.push(state.session_id);
            }
        }
        Ok(removed)
    }
}
