//! entire-core — session checkpoints for AI coding agents.
//!
//! While an agent works, every turn that changes files is recorded as a
//! **temporary checkpoint** on a per-commit **shadow branch**. When the user
//! commits, the session's work is **condensed** into a permanent record on
//! the metadata branch and linked to the commit by a trailer.

pub mod checkpoint;
pub mod condense;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod gitstore;
pub mod id;
pub mod migrate;
pub mod nav;
pub mod phase;
pub mod push;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod shadow;
pub mod trailers;
pub mod transcript;
pub mod worktree;

pub use engine::{Engine, HookInput, RewindKind, RewindPoint, SaveRequest, SummaryGenerator};
pub use error::{EntireError, EntireResult};
pub use id::CheckpointId;
pub use session::{Phase, SessionState};
pub use settings::Settings;
