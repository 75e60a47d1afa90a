//! shipsync core library.
//!
//! This crate provides the foundational components for mirroring commit
//! history between two repositories (git or hg on either side) while
//! applying a caller-supplied content filter to every commit: the blocking
//! shell executor, the advisory repository lock, the unified-diff patch
//! parser, the repository-agnostic changeset model, the git/hg repository
//! backends, and the sync engine itself.

pub mod changeset;
pub mod config;
pub mod errors;
pub mod lock;
pub mod patch;
pub mod repo;
pub mod shell;
pub mod sync;
pub mod tempdir;

// Re-exports for convenience.
pub use changeset::{Changeset, FileDiff};
pub use config::{BaseConfig, SyncOptions};
pub use errors::CoreError;
pub use sync::{Filter, SyncEngine};
