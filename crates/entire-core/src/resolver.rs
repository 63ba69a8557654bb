//! Attribute an ambiguous commit to one of several live sessions.
//!
//! Git hooks run as descendants of whatever launched `git`. When that was an
//! agent tool, the agent's PID (recorded at session start) shows up in our
//! parent chain.

use std::collections::HashMap;

use crate::session::SessionState;

/// Parent-PID hops walked before giving up.
pub const MAX_PID_HOPS: usize = 20;

/// Parent of `pid`, or `None` if unknown.
#[cfg(target_os = "linux")]
pub fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses.
    let (_, tail) = stat.rsplit_once(") ")?;
    tail.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn parent_pid(pid: u32) -> Option<u32> {
    let output = std::process::Command::new("ps")
        .args(["-o", "ppid=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(unix))]
pub fn parent_pid(_pid: u32) -> Option<u32> {
    None
}

/// Pick the session owning the current process tree, falling back to the
/// most recently active session.
pub fn resolve_session(sessions: &[SessionState]) -> Option<&SessionState> {
    resolve_session_with(sessions, std::process::id(), parent_pid)
}

/// [`resolve_session`] with an explicit starting PID and parent lookup.
pub fn resolve_session_with<F>(sessions: &[SessionState], start_pid: u32, lookup: F) -> Option<&SessionState>
where
    F: Fn(u32) -> Option<u32>,
{
    let by_pid: HashMap<u32, &SessionState> = sessions
        .iter()
        .filter(|s| s.agent_pid != 0)
        .map(|s| (s.agent_pid, s))
        .collect();

    if !by_pid.is_empty() {
        let mut pid = start_pid;
        for _ in 0..MAX_PID_HOPS {
            if let Some(session) = by_pid.get(&pid) {
                tracing::debug!(session = %session.session_id, pid, "session resolved by process ancestry");
                return Some(session);
            }
            match lookup(pid) {
                Some(parent) if parent > 0 && parent != pid => pid = parent,
                _ => break,
            }
        }
    }

    most_recent(sessions)
}

fn most_recent(sessions: &[SessionState]) -> Option<&SessionState> {
    // `None < Some(_)`, so sessions without a timestamp lose.
    sessions.iter().max_by_key(|s| s.last_interaction_time)
}
