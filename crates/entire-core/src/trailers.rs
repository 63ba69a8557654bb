//! Commit-message trailers.
//!
//! Shadow-branch commits, metadata-branch commits and the user's own commits
//! all carry `Key: value` lines in their final paragraph. Only the keys below
//! are interpreted; everything else is passed through untouched.

use crate::id::CheckpointId;

pub const CHECKPOINT: &str = "Entire-Checkpoint";
pub const SESSION: &str = "Entire-Session";
pub const METADATA: &str = "Entire-Metadata";
pub const METADATA_TASK: &str = "Entire-Metadata-Task";
pub const STRATEGY: &str = "Entire-Strategy";
pub const AGENT: &str = "Entire-Agent";
pub const BASE_COMMIT: &str = "Base-Commit";

/// A parsed trailer line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub key: String,
    pub value: String,
}

fn parse_line(line: &str) -> Option<Trailer> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty()
        || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        || !line.starts_with(key)
    {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some(Trailer {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#')
}

fn is_scissors(line: &str) -> bool {
    line.starts_with("# ") && line.contains(">8")
}

/// Trailer-shaped lines of the message's final paragraph, ignoring git's `#`
/// comments and anything below a verbose-mode scissors line. The subject
/// paragraph never holds trailers.
pub fn parse(message: &str) -> Vec<Trailer> {
    let lines: Vec<&str> = message
        .lines()
        .take_while(|l| !is_scissors(l))
        .filter(|l| !is_comment(l))
        .collect();
    let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) else {
        return Vec::new();
    };
    let Some(blank) = lines[..last].iter().rposition(|l| l.trim().is_empty()) else {
        return Vec::new();
    };
    lines[blank + 1..=last].iter().filter_map(|l| parse_line(l)).collect()
}

/// All values for `key`, in message order.
pub fn values(message: &str, key: &str) -> Vec<String> {
    parse(message)
        .into_iter()
        .filter(|t| t.key.eq_ignore_ascii_case(key))
        .map(|t| t.value)
        .collect()
}

/// First value for `key`.
pub fn value(message: &str, key: &str) -> Option<String> {
    values(message, key).into_iter().next()
}

/// The first well-formed `Entire-Checkpoint` value.
pub fn checkpoint_id(message: &str) -> Option<CheckpointId> {
    values(message, CHECKPOINT)
        .into_iter()
        .find_map(|v| v.parse().ok())
}

/// Append `key: value` to `message`, keeping git's trailing `#` comment
/// block (present when the editor is used) below the trailer.
pub fn append(message: &str, key: &str, value: &str) -> String {
    let lines: Vec<&str> = message.lines().collect();
    let comment_start = lines
        .iter()
        .rposition(|l| !is_comment(l) && !l.trim().is_empty())
        .map(|last_content| last_content + 1)
        .unwrap_or(0);

    let body: Vec<&str> = lines[..comment_start].to_vec();
    let tail: Vec<&str> = lines[comment_start..]
        .iter()
        .copied()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let mut out = String::new();
    if body.is_empty() {
        out.push('\n');
    } else {
        out.push_str(&body.join("\n"));
        out.push('\n');
        if !last_paragraph_is_trailers(&body) {
            out.push('\n');
        }
    }
    out.push_str(&format!("{key}: {value}\n"));
    if !tail.is_empty() {
        out.push('\n');
        out.push_str(&tail.join("\n"));
        out.push('\n');
    }
    out
}

fn last_paragraph_is_trailers(body: &[&str]) -> bool {
    let paragraph: Vec<&&str> = body
        .iter()
        .rev()
        .take_while(|l| !l.trim().is_empty())
        .collect();
    // A single-paragraph message is a subject line, never a trailer block.
    let has_separator = paragraph.len() < body.len();
    has_separator
        && !paragraph.is_empty()
        && paragraph
            .iter()
            .all(|l| is_comment(l) || parse_line(l).is_some())
}

/// Build a trailer block from `(key, value)` pairs.
pub fn format_block(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}: {v}\n"))
        .collect()
}
