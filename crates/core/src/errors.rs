//! Error types for the shipsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Shell errors
// ---------------------------------------------------------------------------

/// Errors from blocking subprocess invocation.
#[derive(Debug, Error)]
pub enum ShellError {
    /// The binary was not found on `$PATH`.
    #[error("binary not found: {0}")]
    BinaryNotFound(String),

    /// The command exited with a non-zero status.
    ///
    /// Carries the full command string and both output streams so that the
    /// failure can be diagnosed without re-running the command.
    #[error("command '{command}' failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Generic I/O wrapper (spawn failure, pipe error).
    #[error("shell I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the scoped advisory file lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file could not be created or opened.
    #[error("failed to open lock file '{path}': {source}")]
    OpenFailed {
        path: String,
        source: std::io::Error,
    },

    /// Acquiring, upgrading, or downgrading the flock failed.
    #[error("failed to {operation} lock on '{path}': {source}")]
    FlockFailed {
        operation: &'static str,
        path: String,
        source: std::io::Error,
    },

    /// `release` was called on an already-released lock. Programming error.
    #[error("tried to release lock on '{0}' twice")]
    AlreadyReleased(String),
}

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Errors from the git/hg repository backends.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The path is neither a git nor an hg checkout.
    #[error("can't determine type of repo at {0}")]
    UnrecognizedRepo(String),

    /// The path exists but is not usable as the expected repo type.
    #[error("{path} is not a {vcs} repo")]
    WrongRepoType { vcs: &'static str, path: String },

    /// A revision id returned by the native tool was malformed.
    #[error("'{0}' doesn't look like a valid hg changeset id")]
    InvalidRevisionId(String),

    /// Raw patch text could not be parsed.
    #[error("can't parse hunk line: {0}")]
    PatchParse(String),

    /// The patch header could not be separated from the patch body.
    #[error("could not extract patch header for {0}")]
    HeaderExtraction(String),

    /// A changeset could not be applied to the destination. The in-progress
    /// native apply state has already been aborted when this is raised.
    #[error("failed to apply changeset {id}: {source}")]
    ApplyFailed {
        id: String,
        #[source]
        source: ShellError,
    },

    /// Underlying shell failure during a repository operation.
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// Underlying lock failure during a repository operation.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Generic I/O wrapper.
    #[error("repository I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No synced commit was found in the destination and no explicit first
    /// commit was configured, so there is no resume point.
    #[error("couldn't find synced commit id in destination repo")]
    NoSyncedCommit,

    /// A source revision that should exist produced no changeset.
    #[error("unable to get patch for {0}")]
    ChangesetUnavailable(String),

    /// Underlying repository error during sync.
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// Failed to write the stats file or a debug patch file.
    #[error("sync I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
