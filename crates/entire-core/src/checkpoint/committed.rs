//! Committed checkpoints on the permanent metadata branch.
//!
//! Layout of one checkpoint (`a1b2c3d4e5f6`):
//!
//! ```text
//! a1/b2c3d4e5f6/metadata.json      checkpoint-level record
//! a1/b2c3d4e5f6/0/metadata.json    first contributing session
//! a1/b2c3d4e5f6/0/full.jsonl
//! a1/b2c3d4e5f6/0/prompt.txt
//! a1/b2c3d4e5f6/0/context.md
//! a1/b2c3d4e5f6/1/...              second session, if any
//! ```
//!
//! Every mutation writes fresh blobs and trees, commits them on top of the
//! branch tip and moves the branch with a compare-and-swap.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use git2::{ObjectType, Repository, Tree};
use serde::{Deserialize, Serialize};

use super::{join_prompts, CONTEXT_FILE, METADATA_FILE, PROMPT_FILE, PROMPT_SEPARATOR, TRANSCRIPT_FILE};
use crate::error::{EntireError, EntireResult};
use crate::gitstore::{self, EntrySpec, TreeEdits};
use crate::id::CheckpointId;
use crate::trailers;

/// Permanent branch holding committed checkpoints.
pub const METADATA_BRANCH: &str = "entire/checkpoints/v1";

/// Upper bound on checkpoint directories visited by [`CommittedStore::list_committed`].
pub const MAX_LIST: usize = 10_000;

const MAX_SWAP_ATTEMPTS: usize = 5;

/// LLM-generated summary of a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub intent: String,
    pub outcome: String,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub friction: Vec<String>,
}

/// Where a session's files live inside a checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
    /// Subdirectory name, e.g. `"0"`.
    pub dir: String,
}

/// Checkpoint-level `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedMetadata {
    pub checkpoint_id: CheckpointId,
    pub strategy: String,
    pub agent: String,
    pub created_at: DateTime<Utc>,
    pub session_ids: Vec<String>,
    pub files_touched: Vec<String>,
    /// Temporary checkpoints folded in, across all sessions.
    #[serde(default)]
    pub checkpoints_count: u32,
    pub sessions: Vec<SessionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl CommittedMetadata {
    fn session_dir(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .map(|s| s.dir.as_str())
    }
}

/// Session-level `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub agent: String,
    pub created_at: DateTime<Utc>,
    /// Transcript items that belonged to earlier checkpoints.
    pub transcript_start: usize,
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub checkpoints_count: u32,
}

/// Everything stored for one session inside a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContent {
    pub metadata: SessionMetadata,
    pub transcript: Vec<u8>,
    pub prompts: String,
    pub context: String,
}

/// Inputs for [`CommittedStore::write_committed`].
#[derive(Debug, Clone)]
pub struct WriteCommittedOptions<'a> {
    pub checkpoint_id: &'a CheckpointId,
    pub session_id: &'a str,
    pub strategy: &'a str,
    pub agent: &'a str,
    pub transcript: &'a [u8],
    pub prompts: &'a [String],
    pub context: &'a str,
    pub files_touched: &'a [String],
    pub transcript_start: usize,
    pub checkpoints_count: u32,
    pub summary: Option<Summary>,
}

/// Inputs for [`CommittedStore::update_committed`].
#[derive(Debug, Clone)]
pub struct UpdateCommittedOptions<'a> {
    pub checkpoint_id: &'a CheckpointId,
    pub session_id: &'a str,
    /// Bytes appended to the session's transcript.
    pub transcript_append: &'a [u8],
    /// Prompts appended to the session's `prompt.txt`.
    pub prompts: &'a [String],
    /// Replacement for the session's `context.md`.
    pub context: &'a str,
}

/// Read/write access to the metadata branch.
pub struct CommittedStore<'r> {
    repo: &'r Repository,
    branch: String,
}

impl<'r> CommittedStore<'r> {
    pub fn new(repo: &'r Repository) -> Self {
        Self::with_branch(repo, METADATA_BRANCH)
    }

    pub fn with_branch(repo: &'r Repository, branch: &str) -> Self {
        Self {
            repo,
            branch: branch.to_string(),
        }
    }

    fn tip_tree(&self) -> EntireResult<Option<Tree<'r>>> {
        match gitstore::branch_tip(self.repo, &self.branch)? {
            Some(oid) => {
                let commit = self
                    .repo
                    .find_commit(oid)
                    .map_err(|e| EntireError::Corrupt(format!("{}: {}", self.branch, e.message())))?;
                Ok(Some(commit.tree()?))
            }
            None => Ok(None),
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, tree: &Tree<'_>, path: &str) -> EntireResult<Option<T>> {
        match gitstore::read_blob(self.repo, tree, path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_metadata_in(&self, tree: &Tree<'_>, id: &CheckpointId) -> EntireResult<Option<CommittedMetadata>> {
        self.read_json(tree, &format!("{}/{METADATA_FILE}", id.shard_path()))
    }

    fn read_text_in(&self, tree: &Tree<'_>, path: &str) -> EntireResult<String> {
        Ok(gitstore::read_blob(self.repo, tree, path)?
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default())
    }

    fn blob_json<T: Serialize>(&self, value: &T) -> EntireResult<Option<EntrySpec>> {
        let json = serde_json::to_vec_pretty(value)?;
        Ok(Some(EntrySpec::blob(self.repo.blob(&json)?)))
    }

    fn blob(&self, data: &[u8]) -> EntireResult<Option<EntrySpec>> {
        Ok(Some(EntrySpec::blob(self.repo.blob(data)?)))
    }

    /// Build edits against the current tip and commit them; on a lost race
    /// the closure runs again against the new tip.
    fn mutate<F>(&self, mut build: F) -> EntireResult<()>
    where
        F: FnMut(Option<&Tree<'r>>) -> EntireResult<(TreeEdits, String)>,
    {
        let refname = gitstore::branch_ref(&self.branch);
        let sig = gitstore::signature(self.repo)?;

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let tip = gitstore::branch_tip(self.repo, &self.branch)?;
            let parent = match tip {
                Some(oid) => Some(
                    self.repo
                        .find_commit(oid)
                        .map_err(|e| EntireError::Corrupt(format!("{}: {}", self.branch, e.message())))?,
                ),
                None => None,
            };
            let base_tree = match &parent {
                Some(c) => Some(c.tree()?),
                None => None,
            };

            let (edits, message) = build(base_tree.as_ref())?;
            let tree_oid = gitstore::apply_edits(self.repo, base_tree.as_ref(), &edits)?;
            let tree = self.repo.find_tree(tree_oid)?;
            let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
            let oid = self.repo.commit(None, &sig, &sig, &message, &tree, &parents)?;

            match gitstore::swap_ref(self.repo, &refname, tip, oid, "entire: checkpoint metadata") {
                Ok(()) => return Ok(()),
                Err(EntireError::RefUpdateConflict(_)) => {
                    tracing::debug!(branch = %self.branch, "metadata branch moved, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(EntireError::RefUpdateConflict(refname))
    }

    /// Write a session's record into a checkpoint.
    ///
    /// Creates the checkpoint directory on first use. For an existing
    /// checkpoint the session's record is added and `files_touched` becomes
    /// the union. Records are append-only: a session that already has one is
    /// rejected, and later work goes through [`Self::update_committed`].
    pub fn write_committed(&self, opts: &WriteCommittedOptions<'_>) -> EntireResult<CommittedMetadata> {
        let id = opts.checkpoint_id;
        let shard = id.shard_path();
        let mut written = None;

        self.mutate(|tree| {
            let existing = match tree {
                Some(t) => self.read_metadata_in(t, id)?,
                None => None,
            };
            let now = Utc::now();
            let mut meta = existing.unwrap_or_else(|| CommittedMetadata {
                checkpoint_id: id.clone(),
                strategy: opts.strategy.to_string(),
                agent: opts.agent.to_string(),
                created_at: now,
                session_ids: Vec::new(),
                files_touched: Vec::new(),
                checkpoints_count: 0,
                sessions: Vec::new(),
                summary: None,
            });

            if meta.session_dir(opts.session_id).is_some() {
                return Err(EntireError::InvalidInput(format!(
                    "checkpoint {id} already records session {}",
                    opts.session_id
                )));
            }
            let dir = meta.sessions.len().to_string();
            meta.sessions.push(SessionRef {
                session_id: opts.session_id.to_string(),
                dir: dir.clone(),
            });
            meta.session_ids.push(opts.session_id.to_string());

            meta.files_touched = union(&meta.files_touched, opts.files_touched);
            meta.checkpoints_count += opts.checkpoints_count;
            if opts.summary.is_some() {
                meta.summary = opts.summary.clone();
            }

            let session_meta = SessionMetadata {
                session_id: opts.session_id.to_string(),
                agent: opts.agent.to_string(),
                created_at: now,
                transcript_start: opts.transcript_start,
                files_touched: opts.files_touched.to_vec(),
                checkpoints_count: opts.checkpoints_count,
            };

            let session_path = format!("{shard}/{dir}");
            let mut edits = TreeEdits::new();
            edits.insert(format!("{session_path}/{METADATA_FILE}"), self.blob_json(&session_meta)?);
            edits.insert(format!("{session_path}/{TRANSCRIPT_FILE}"), self.blob(opts.transcript)?);
            edits.insert(
                format!("{session_path}/{PROMPT_FILE}"),
                self.blob(join_prompts(opts.prompts).as_bytes())?,
            );
            edits.insert(format!("{session_path}/{CONTEXT_FILE}"), self.blob(opts.context.as_bytes())?);
            edits.insert(format!("{shard}/{METADATA_FILE}"), self.blob_json(&meta)?);

            let message = checkpoint_message(&format!("Checkpoint: {id}"), &meta);
            written = Some(meta);
            Ok((edits, message))
        })?;

        written.ok_or_else(|| EntireError::Other("checkpoint write produced no metadata".into()))
    }

    /// Full metadata record of a checkpoint.
    pub fn read_committed(&self, id: &CheckpointId) -> EntireResult<CommittedMetadata> {
        let tree = self
            .tip_tree()?
            .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
        self.read_metadata_in(&tree, id)?
            .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))
    }

    /// Every checkpoint on the branch, newest first.
    pub fn list_committed(&self) -> EntireResult<Vec<CommittedMetadata>> {
        let Some(tree) = self.tip_tree()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut visited = 0usize;

        'shards: for shard in tree.iter() {
            let Some(prefix) = shard.name() else { continue };
            if prefix.len() != 2 || shard.kind() != Some(ObjectType::Tree) {
                continue;
            }
            let shard_tree = self.repo.find_tree(shard.id())?;
            for entry in shard_tree.iter() {
                visited += 1;
                if visited > MAX_LIST {
                    tracing::warn!(limit = MAX_LIST, "checkpoint listing truncated");
                    break 'shards;
                }
                let Some(id) = entry.name().and_then(|rest| CheckpointId::from_shard(prefix, rest)) else {
                    continue;
                };
                match self.read_metadata_in(&tree, &id) {
                    Ok(Some(meta)) => out.push(meta),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(checkpoint = %id, error = %e, "skipping unreadable checkpoint"),
                }
            }
        }

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// One session's stored files.
    pub fn read_session_content(&self, id: &CheckpointId, session_id: &str) -> EntireResult<SessionContent> {
        let tree = self
            .tip_tree()?
            .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
        let meta = self
            .read_metadata_in(&tree, id)?
            .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
        let dir = meta
            .session_dir(session_id)
            .ok_or_else(|| EntireError::CheckpointNotFound(format!("{id} (session {session_id})")))?;
        let base = format!("{}/{dir}", id.shard_path());

        let metadata: SessionMetadata = self
            .read_json(&tree, &format!("{base}/{METADATA_FILE}"))?
            .ok_or_else(|| EntireError::Corrupt(format!("{base}/{METADATA_FILE} missing")))?;
        Ok(SessionContent {
            metadata,
            transcript: gitstore::read_blob(self.repo, &tree, &format!("{base}/{TRANSCRIPT_FILE}"))?
                .unwrap_or_default(),
            prompts: self.read_text_in(&tree, &format!("{base}/{PROMPT_FILE}"))?,
            context: self.read_text_in(&tree, &format!("{base}/{CONTEXT_FILE}"))?,
        })
    }

    /// Replace only the summary of an existing checkpoint.
    pub fn update_summary(&self, id: &CheckpointId, summary: Summary) -> EntireResult<()> {
        self.mutate(|tree| {
            let mut meta = match tree {
                Some(t) => self.read_metadata_in(t, id)?,
                None => None,
            }
            .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
            meta.summary = Some(summary.clone());

            let mut edits = TreeEdits::new();
            edits.insert(format!("{}/{METADATA_FILE}", id.shard_path()), self.blob_json(&meta)?);
            let message = checkpoint_message(&format!("Update summary for checkpoint {id}"), &meta);
            Ok((edits, message))
        })
    }

    /// Append to one session's transcript and prompts and replace its
    /// context. Sibling sessions and `files_touched` are not modified.
    pub fn update_committed(&self, opts: &UpdateCommittedOptions<'_>) -> EntireResult<()> {
        let id = opts.checkpoint_id;
        self.mutate(|tree| {
            let tree = tree.ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
            let meta = self
                .read_metadata_in(tree, id)?
                .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
            let dir = meta
                .session_dir(opts.session_id)
                .ok_or_else(|| EntireError::CheckpointNotFound(format!("{id} (session {})", opts.session_id)))?;
            let base = format!("{}/{dir}", id.shard_path());

            let transcript_path = format!("{base}/{TRANSCRIPT_FILE}");
            let mut transcript = gitstore::read_blob(self.repo, tree, &transcript_path)?.unwrap_or_default();
            transcript.extend_from_slice(opts.transcript_append);

            let prompt_path = format!("{base}/{PROMPT_FILE}");
            let mut prompts = self.read_text_in(tree, &prompt_path)?;
            if !opts.prompts.is_empty() {
                if !prompts.is_empty() {
                    prompts.push_str(PROMPT_SEPARATOR);
                }
                prompts.push_str(&join_prompts(opts.prompts));
            }

            let mut edits = TreeEdits::new();
            edits.insert(transcript_path, self.blob(&transcript)?);
            edits.insert(prompt_path, self.blob(prompts.as_bytes())?);
            edits.insert(format!("{base}/{CONTEXT_FILE}"), self.blob(opts.context.as_bytes())?);

            let message = checkpoint_message(&format!("Update checkpoint {id}"), &meta);
            Ok((edits, message))
        })
    }

    /// Union `files` into the checkpoint's `files_touched` and into the
    /// session's own record. Transcripts and sibling sessions are untouched.
    pub fn merge_files_touched(
        &self,
        id: &CheckpointId,
        session_id: &str,
        files: &[String],
    ) -> EntireResult<()> {
        self.mutate(|tree| {
            let tree = tree.ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
            let mut meta = self
                .read_metadata_in(tree, id)?
                .ok_or_else(|| EntireError::CheckpointNotFound(id.to_string()))?;
            let dir = meta
                .session_dir(session_id)
                .ok_or_else(|| EntireError::CheckpointNotFound(format!("{id} (session {session_id})")))?;
            let session_path = format!("{}/{dir}/{METADATA_FILE}", id.shard_path());
            let mut session_meta: SessionMetadata = self
                .read_json(tree, &session_path)?
                .ok_or_else(|| EntireError::Corrupt(format!("{session_path} missing")))?;

            session_meta.files_touched = union(&session_meta.files_touched, files);
            meta.files_touched = union(&meta.files_touched, files);

            let mut edits = TreeEdits::new();
            edits.insert(session_path, self.blob_json(&session_meta)?);
            edits.insert(format!("{}/{METADATA_FILE}", id.shard_path()), self.blob_json(&meta)?);
            let message = checkpoint_message(&format!("Update files for checkpoint {id}"), &meta);
            Ok((edits, message))
        })
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().chain(b).cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

fn checkpoint_message(subject: &str, meta: &CommittedMetadata) -> String {
    let mut pairs: Vec<(&str, &str)> = meta
        .session_ids
        .iter()
        .map(|s| (trailers::SESSION, s.as_str()))
        .collect();
    pairs.push((trailers::STRATEGY, meta.strategy.as_str()));
    pairs.push((trailers::AGENT, meta.agent.as_str()));
    format!("{subject}\n\n{}", trailers::format_block(&pairs))
}
