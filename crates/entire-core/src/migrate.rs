//! One-time migrations for data written by older releases.
//!
//! Everything that knows about legacy formats lives here. Loaders call these
//! functions once and the rest of the crate only sees the current shape.

use serde_json::Value;

use crate::error::EntireResult;
use crate::gitstore;
use crate::session::Phase;
use crate::shadow;

/// Bring a raw session JSON object up to the current schema.
///
/// * `condensed_transcript_lines` became `checkpoint_transcript_start`.
/// * `transcript_lines_at_start` is no longer used.
/// * empty or unknown `phase` values mean `idle`.
/// * sessions recorded before PID tracking have no usable `agent_pid`.
///
/// Returns true if anything changed.
pub fn migrate_session_json(raw: &mut Value) -> bool {
    let Some(obj) = raw.as_object_mut() else {
        return false;
    };
    let mut changed = false;

    if let Some(lines) = obj.remove("condensed_transcript_lines") {
        changed = true;
        if !obj.contains_key("checkpoint_transcript_start") {
            obj.insert("checkpoint_transcript_start".to_string(), lines);
        }
    }

    if obj.remove("transcript_lines_at_start").is_some() {
        changed = true;
    }

    let phase = obj.get("phase").and_then(Value::as_str).map(str::to_string);
    match phase {
        Some(p) if Phase::parse(&p).as_str() == p => {}
        Some(p) => {
            obj.insert("phase".to_string(), Value::from(Phase::parse(&p).as_str()));
            changed = true;
        }
        None => {
            obj.insert("phase".to_string(), Value::from(Phase::Idle.as_str()));
            changed = true;
        }
    }

    let pid_ok = obj.get("agent_pid").and_then(Value::as_u64).is_some();
    if !pid_ok {
        obj.insert("agent_pid".to_string(), Value::from(0u32));
        changed = true;
    }

    changed
}

/// Move an unsuffixed `entire/<hash7>` branch to `entire/<hash7>-1`.
///
/// The suffix-1 ref is created at the legacy tip before the legacy ref is
/// deleted, so the work is never unreachable. A suffix-1 branch holding
/// different work is left alone along with the legacy ref. Returns true if a
/// legacy branch was migrated.
pub fn migrate_legacy_shadow_branch(repo: &git2::Repository, base_commit: &str) -> EntireResult<bool> {
    let legacy = shadow::legacy_branch_name(base_commit);
    let Some(tip) = gitstore::branch_tip(repo, &legacy)? else {
        return Ok(false);
    };

    let target = shadow::shadow_branch_name(base_commit, 1);
    match gitstore::branch_tip(repo, &target)? {
        None => {
            repo.reference(
                &gitstore::branch_ref(&target),
                tip,
                false,
                "entire: migrate legacy shadow branch",
            )?;
        }
        Some(existing) if existing == tip => {}
        Some(_) => {
            tracing::warn!(legacy = %legacy, target = %target, "suffixed shadow branch already exists");
            return Ok(false);
        }
    }
    gitstore::delete_branch(repo, &legacy)?;
    tracing::info!(from = %legacy, to = %target, "migrated legacy shadow branch");
    Ok(true)
}
