//! Transcript access.
//!
//! Agent tools write their conversation in their own formats. The engine only
//! needs three things from a transcript: the prompts it contains, how many
//! addressable items it has, and the bytes from a given item onwards. Those
//! are expressed by [`TranscriptAdapter`]; [`JsonlTranscript`] covers the
//! common one-JSON-object-per-line layout.

use serde_json::Value;

/// Format-specific view over raw transcript bytes.
pub trait TranscriptAdapter {
    /// User prompts in order of appearance.
    fn extract_prompts(&self, data: &[u8]) -> Vec<String>;
    /// Number of addressable items (the unit of the condensed cursor).
    fn count_items(&self, data: &[u8]) -> usize;
    /// Raw bytes of items `start..`, byte-for-byte as they appear in `data`.
    fn slice_from(&self, data: &[u8], start: usize) -> Vec<u8>;
}

/// JSON Lines transcripts: one item per non-empty line.
///
/// A line is a prompt when its `type` or `role` (top level or under
/// `message`) is `"user"` and it carries textual content.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlTranscript;

impl JsonlTranscript {
    fn items(data: &[u8]) -> impl Iterator<Item = &[u8]> {
        data.split_inclusive(|b| *b == b'\n')
            .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
    }
}

impl TranscriptAdapter for JsonlTranscript {
    fn extract_prompts(&self, data: &[u8]) -> Vec<String> {
        Self::items(data)
            .filter_map(|line| serde_json::from_slice::<Value>(line).ok())
            .filter_map(|v| user_text(&v))
            .collect()
    }

    fn count_items(&self, data: &[u8]) -> usize {
        Self::items(data).count()
    }

    fn slice_from(&self, data: &[u8], start: usize) -> Vec<u8> {
        Self::items(data).skip(start).flatten().copied().collect()
    }
}

fn user_text(v: &Value) -> Option<String> {
    let message = v.get("message").unwrap_or(v);
    let is_user = [v.get("type"), v.get("role"), message.get("role")]
        .into_iter()
        .flatten()
        .any(|r| r == "user");
    if !is_user {
        return None;
    }

    let content = message.get("content")?;
    let text = match content {
        Value::String(s) => s.clone(),
        // Content blocks: keep the text parts, skip tool results.
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Render the `context.md` stored next to each session transcript.
pub fn generate_context(session_id: &str, prompts: &[String], files_touched: &[String]) -> String {
    let mut out = String::from("# Session Context\n\n");
    out.push_str(&format!("Session ID: {session_id}\n\n"));

    out.push_str("## Prompts\n\n");
    if prompts.is_empty() {
        out.push_str("(none)\n\n");
    }
    for (i, prompt) in prompts.iter().enumerate() {
        out.push_str(&format!("### Prompt {}\n\n{}\n\n", i + 1, prompt.trim()));
    }

    out.push_str("## Files Touched\n\n");
    if files_touched.is_empty() {
        out.push_str("(none)\n");
    }
    for file in files_touched {
        out.push_str(&format!("- {file}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        r#"{"type":"user","message":{"role":"user","content":"add a login form"}}"#,
        "\n",
        r#"{"type":"assistant","message":{"role":"assistant","content":"done"}}"#,
        "\n\n",
        r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","content":"ok"}]}}"#,
        "\n",
        r#"{"role":"user","content":[{"type":"text","text":"now add tests"}]}"#,
        "\n",
    );

    #[test]
    fn test_count_skips_blank_lines() {
        assert_eq!(JsonlTranscript.count_items(SAMPLE.as_bytes()), 4);
    }

    #[test]
    fn test_extract_prompts_skips_tool_results() {
        let prompts = JsonlTranscript.extract_prompts(SAMPLE.as_bytes());
        assert_eq!(prompts, vec!["add a login form", "now add tests"]);
    }

    #[test]
    fn test_slice_from_keeps_bytes() {
        let tail = JsonlTranscript.slice_from(SAMPLE.as_bytes(), 3);
        let tail = String::from_utf8(tail).unwrap();
        assert!(tail.starts_with(r#"{"role":"user""#));
        assert!(tail.ends_with('\n'));
        assert!(JsonlTranscript.slice_from(SAMPLE.as_bytes(), 10).is_empty());
    }

    #[test]
    fn test_generate_context_lists_prompts_and_files() {
        let ctx = generate_context(
            "s1",
            &["first".to_string(), "second".to_string()],
            &["src/lib.rs".to_string()],
        );
        assert!(ctx.contains("### Prompt 2\n\nsecond"));
        assert!(ctx.contains("- src/lib.rs"));
    }
}
