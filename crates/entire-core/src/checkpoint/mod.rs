//! Checkpoint storage on git objects.
//!
//! Two regimes share one layout vocabulary:
//!
//! * [`temporary`] checkpoints are commits on a shadow branch. Their tree is
//!   the agent's edits on top of the base commit plus a
//!   `.entire/metadata/<session-id>/` subtree.
//! * [`committed`] checkpoints live on the permanent metadata branch under a
//!   sharded `<id[..2]>/<id[2..]>/` directory and are linked to a user commit
//!   through its `Entire-Checkpoint` trailer.

pub mod committed;
pub mod temporary;

use crate::settings::ENTIRE_DIR;

/// Transcript file name inside a session metadata directory.
pub const TRANSCRIPT_FILE: &str = "full.jsonl";
/// Prompts file name inside a session metadata directory.
pub const PROMPT_FILE: &str = "prompt.txt";
/// Generated context file name inside a session metadata directory.
pub const CONTEXT_FILE: &str = "context.md";
/// Metadata record file name.
pub const METADATA_FILE: &str = "metadata.json";

/// Separator placed between prompts in `prompt.txt`.
pub const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Repository-relative directory holding a session's temporary metadata.
pub fn session_metadata_dir(session_id: &str) -> String {
    format!("{ENTIRE_DIR}/metadata/{session_id}")
}

/// Repository-relative directory holding a task checkpoint's metadata.
pub fn task_metadata_dir(session_id: &str, tool_use_id: &str) -> String {
    format!("{}/tasks/{tool_use_id}", session_metadata_dir(session_id))
}

/// Join prompts the way `prompt.txt` stores them.
pub fn join_prompts(prompts: &[String]) -> String {
    prompts.join(PROMPT_SEPARATOR)
}

/// Split `prompt.txt` back into prompts.
pub fn split_prompts(text: &str) -> Vec<String> {
    text.split(PROMPT_SEPARATOR)
        .map(str::to_string)
        .filter(|p| !p.is_empty())
        .collect()
}
