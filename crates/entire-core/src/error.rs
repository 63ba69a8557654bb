//! Error types for entire operations.

use std::fmt;
use std::io;

/// All possible entire errors.
#[derive(Debug)]
pub enum EntireError {
    /// The current directory is not inside a git repository.
    NotARepo,
    /// Checkpointing is turned off in `.entire/settings.json`.
    Disabled,
    /// No committed checkpoint (or no session inside it) matches the ID.
    CheckpointNotFound(String),
    /// A branch or reference could not be resolved.
    BranchNotFound(String),
    /// A git object could not be read or had the wrong shape.
    Corrupt(String),
    /// Caller supplied a malformed value.
    InvalidInput(String),
    /// A reference kept moving underneath us and every retry lost the race.
    RefUpdateConflict(String),
    /// An I/O error occurred.
    Io(io::Error),
    /// JSON serialization/deserialization failed.
    Json(serde_json::Error),
    /// libgit2 reported an error.
    Git(git2::Error),
    /// Generic error with a message.
    Other(String),
}

impl EntireError {
    /// True for the "not found" family, which callers surface as a plain
    /// message instead of a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EntireError::CheckpointNotFound(_) | EntireError::BranchNotFound(_))
    }
}

impl fmt::Display for EntireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntireError::NotARepo => write!(f, "not a git repository"),
            EntireError::Disabled => {
                write!(f, "entire is disabled for this repository (see .entire/settings.json)")
            }
            EntireError::CheckpointNotFound(id) => write!(f, "checkpoint not found: {id}"),
            EntireError::BranchNotFound(name) => write!(f, "branch not found: {name}"),
            EntireError::Corrupt(msg) => write!(f, "corrupt git object: {msg}"),
            EntireError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EntireError::RefUpdateConflict(name) => {
                write!(f, "reference {name} changed concurrently, giving up")
            }
            EntireError::Io(e) => write!(f, "I/O error: {e}"),
            EntireError::Json(e) => write!(f, "JSON error: {e}"),
            EntireError::Git(e) => write!(f, "git error: {}", e.message()),
            EntireError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EntireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EntireError::Io(e) => Some(e),
            EntireError::Json(e) => Some(e),
            EntireError::Git(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EntireError {
    fn from(e: io::Error) -> Self {
        EntireError::Io(e)
    }
}

impl From<serde_json::Error> for EntireError {
    fn from(e: serde_json::Error) -> Self {
        EntireError::Json(e)
    }
}

impl From<git2::Error> for EntireError {
    fn from(e: git2::Error) -> Self {
        EntireError::Git(e)
    }
}

/// Convenience alias for Results in entire.
pub type EntireResult<T> = Result<T, EntireError>;
