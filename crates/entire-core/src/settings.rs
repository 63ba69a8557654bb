//! Repository settings stored under `.entire/`.
//!
//! `settings.json` is meant to be committed; `settings.local.json` holds
//! per-clone overrides and wins field by field.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EntireResult;

/// Name of the administrative directory at the worktree root.
pub const ENTIRE_DIR: &str = ".entire";

/// Strategy recorded in checkpoint metadata.
pub const DEFAULT_STRATEGY: &str = "manual-commit";

/// Effective settings for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master switch. Hooks do nothing when false.
    pub enabled: bool,
    /// Strategy name written into committed checkpoints.
    pub strategy: String,
    /// Push the metadata branch alongside user pushes.
    pub push_sessions: bool,
    /// Ask before pushing the metadata branch.
    pub ask_before_push: bool,
    /// Agent name used when a hook does not report one.
    pub agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: DEFAULT_STRATEGY.to_string(),
            push_sessions: false,
            ask_before_push: true,
            agent: "unknown".to_string(),
        }
    }
}

impl Settings {
    /// Load `.entire/settings.json` overlaid with `.entire/settings.local.json`.
    /// Missing files yield defaults.
    pub fn load(worktree_root: &Path) -> EntireResult<Self> {
        let dir = worktree_root.join(ENTIRE_DIR);
        let mut merged = serde_json::to_value(Settings::default())?;

        for name in ["settings.json", "settings.local.json"] {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            let layer: Value = serde_json::from_str(&data)?;
            overlay(&mut merged, layer);
        }

        Ok(serde_json::from_value(merged)?)
    }
}

fn overlay(base: &mut Value, layer: Value) {
    if let (Value::Object(base), Value::Object(layer)) = (base, layer) {
        for (key, value) in layer {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_files() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.enabled);
        assert_eq!(settings.strategy, "manual-commit");
    }

    #[test]
    fn test_local_overrides_project() {
        let dir = tempdir().unwrap();
        let entire = dir.path().join(ENTIRE_DIR);
        fs::create_dir_all(&entire).unwrap();
        fs::write(
            entire.join("settings.json"),
            r#"{"push_sessions": true, "agent": "Claude Code"}"#,
        )
        .unwrap();
        fs::write(entire.join("settings.local.json"), r#"{"enabled": false}"#).unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert!(!settings.enabled);
        assert!(settings.push_sessions);
        assert_eq!(settings.agent, "Claude Code");
        assert!(settings.ask_before_push);
    }

    #[test]
    fn test_malformed_settings_is_error() {
        let dir = tempdir().unwrap();
        let entire = dir.path().join(ENTIRE_DIR);
        fs::create_dir_all(&entire).unwrap();
        fs::write(entire.join("settings.json"), "{not json").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
