//! Checkpoint identifiers.
//!
//! A checkpoint ID is 12 lowercase hex characters. On the metadata branch it
//! is sharded as `<first 2>/<remaining 10>`, the same prefix-directory scheme
//! git uses for loose objects.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::EntireError;

/// Length of a checkpoint ID in hex characters.
pub const CHECKPOINT_ID_LEN: usize = 12;

static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A validated 12-hex-character checkpoint ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Generate a fresh ID for `session_id`.
    ///
    /// The ID is the SHA-256 prefix of the session ID, the wall clock in
    /// nanoseconds, the process ID and a process-local counter.
    pub fn generate(session_id: &str) -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let seq = GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let seed = format!("{session_id}:{nanos}:{}:{seq}", std::process::id());
        let digest = hash_bytes(seed.as_bytes());
        CheckpointId(digest[..CHECKPOINT_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard directory on the metadata branch, e.g. `a1/b2c3d4e5f6`.
    pub fn shard_path(&self) -> String {
        let (prefix, rest) = self.0.split_at(2);
        format!("{prefix}/{rest}")
    }

    /// Rebuild an ID from its two shard components.
    pub fn from_shard(prefix: &str, rest: &str) -> Option<Self> {
        format!("{prefix}{rest}").parse().ok()
    }
}

impl FromStr for CheckpointId {
    type Err = EntireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != CHECKPOINT_ID_LEN
            || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(EntireError::InvalidInput(format!(
                "checkpoint ID must be {CHECKPOINT_ID_LEN} lowercase hex characters, got '{s}'"
            )));
        }
        Ok(CheckpointId(s.to_string()))
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CheckpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CheckpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the SHA-256 hash of arbitrary bytes, returned as a hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
