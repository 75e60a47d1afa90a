//! Repository backends.
//!
//! A backend binds a filesystem path to a checked-out branch and exposes
//! two capability traits: [`SourceRepo`] for reading history and
//! [`DestinationRepo`] for writing it. The concrete [`GitRepo`] and
//! [`HgRepo`] types implement both; which one a path gets is decided by
//! probing for `.git` / `.hg`, a closed set rather than open-ended
//! polymorphism.

pub mod git;
pub mod hg;

use std::path::Path;

use chrono::DateTime;
use regex_lite::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::changeset::Changeset;
use crate::errors::RepoError;
use crate::tempdir::ScopedTempDir;

pub use git::GitRepo;
pub use hg::HgRepo;

// ---------------------------------------------------------------------------
// Tracing channels
// ---------------------------------------------------------------------------

/// Which backend activity gets traced.
///
/// Passed into backend constructors; each flag gates one channel of
/// `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracer {
    pub fetch: bool,
    pub shell: bool,
    pub shell_input: bool,
    pub shell_output: bool,
}

impl Tracer {
    /// The channels enabled by a single `-v`: fetch and shell.
    pub fn standard() -> Self {
        Self {
            fetch: true,
            shell: true,
            shell_input: false,
            shell_output: false,
        }
    }

    pub(crate) fn trace_fetch(&self, message: &str) {
        if self.fetch {
            info!(target: "shipsync::fetch", "{message}");
        }
    }

    pub(crate) fn trace_shell(&self, command: &str) {
        if self.shell {
            debug!(target: "shipsync::shell", "$ {command}");
        }
    }

    pub(crate) fn trace_shell_input(&self, input: &str) {
        if self.shell_input {
            debug!(target: "shipsync::shell", "--STDIN--\n{input}");
        }
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// An exported tree: the temp directory holding it and the revision it
/// was materialized from.
#[derive(Debug)]
pub struct Export {
    pub temp_dir: ScopedTempDir,
    pub revision: String,
}

/// Operations shared by every repository handle.
pub trait Repo {
    fn path(&self) -> &Path;

    fn branch(&self) -> &str;

    /// Move the configured branch to `base_rev` and check it out.
    fn update_branch_to(&self, base_rev: &str) -> Result<(), RepoError>;

    /// Remove untracked files from the working copy.
    fn clean(&self) -> Result<(), RepoError>;

    /// Update the checkout from its upstream.
    fn pull(&self) -> Result<(), RepoError>;

    /// The changeset at the head of the configured branch, if any.
    fn head_changeset(&self) -> Result<Option<Changeset>, RepoError>;
}

/// A repository history can be read from.
pub trait SourceRepo: Repo {
    /// Oldest direct descendant of `revision` restricted to `roots`,
    /// ancestry-path only, merges excluded.
    fn find_next_commit(
        &self,
        revision: &str,
        roots: &[String],
    ) -> Result<Option<String>, RepoError>;

    /// Standardized representation of the given revision.
    fn changeset_from_id(&self, revision: &str) -> Result<Option<Changeset>, RepoError>;

    /// Raw patch body for a revision: pure code changes, no header data.
    fn native_patch_from_id(&self, revision: &str) -> Result<String, RepoError>;

    /// Raw metadata envelope for a revision: author, date, message.
    fn native_header_from_id(&self, revision: &str) -> Result<String, RepoError>;

    /// Materialize the tree at `rev` (default: current head) restricted to
    /// `roots` into a fresh temporary directory.
    fn export(&self, roots: &[String], rev: Option<&str>) -> Result<Export, RepoError>;
}

/// A repository new commits can be written to.
pub trait DestinationRepo: Repo {
    /// The source revision recorded by the most recent tracking footer in
    /// the destination history, restricted to `roots`.
    fn find_last_source_commit(&self, roots: &[String]) -> Result<Option<String>, RepoError>;

    /// Render a changeset as a mailbox-format text patch ready for the
    /// native apply tool.
    fn render_patch(&self, changeset: &Changeset) -> String;

    /// Commit a changeset; returns the new revision id.
    fn commit_patch(&self, changeset: &Changeset) -> Result<String, RepoError>;

    /// Push local commits upstream.
    fn push(&self) -> Result<(), RepoError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Open the repository at `path` as a source, probing its type.
pub fn open_source(
    path: &Path,
    branch: &str,
    tracer: Tracer,
) -> Result<Box<dyn SourceRepo>, RepoError> {
    if path.join(".git").exists() {
        return Ok(Box::new(GitRepo::open(path, branch, tracer)?));
    }
    if path.join(".hg").exists() {
        return Ok(Box::new(HgRepo::open(path, branch, tracer)?));
    }
    Err(RepoError::UnrecognizedRepo(path.display().to_string()))
}

/// Open the repository at `path` as a destination, probing its type.
pub fn open_destination(
    path: &Path,
    branch: &str,
    tracer: Tracer,
) -> Result<Box<dyn DestinationRepo>, RepoError> {
    if path.join(".git").exists() {
        return Ok(Box::new(GitRepo::open(path, branch, tracer)?));
    }
    if path.join(".hg").exists() {
        return Ok(Box::new(HgRepo::open(path, branch, tracer)?));
    }
    Err(RepoError::UnrecognizedRepo(path.display().to_string()))
}

// ---------------------------------------------------------------------------
// Shared rendering
// ---------------------------------------------------------------------------

fn message_escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(diff -|Index: |---(?:\s\S|\s*$))").expect("static regex")
    })
}

/// Commit message as committed: subject, blank line, body.
pub(crate) fn commit_message(changeset: &Changeset) -> String {
    format!("{}\n\n{}", changeset.subject(), changeset.message())
        .trim()
        .to_string()
}

/// Render the mailbox-style patch shared by both backends.
///
/// When `escape_message` is set, any message line that the mail splitter
/// in `git am` would mistake for the start of the patch is prefixed with a
/// space.
pub(crate) fn render_mailbox_patch(changeset: &Changeset, escape_message: bool) -> String {
    let message = if escape_message {
        message_escape_re()
            .replace_all(changeset.message(), " $1")
            .into_owned()
    } else {
        changeset.message().to_string()
    };

    let date = DateTime::from_timestamp(changeset.timestamp(), 0)
        .unwrap_or_default()
        .to_rfc2822();

    // Mon Sep 17 is the magic date used by format-patch to distinguish a
    // patch from a real mailbox. cf. https://git-scm.com/docs/git-format-patch
    let mut out = format!(
        "From {id} Mon Sep 17 00:00:00 2001\n\
         From: {author}\n\
         Date: {date}\n\
         Subject: [PATCH] {subject}\n\n\
         {message}\n---\n\n",
        id = changeset.id(),
        author = changeset.author(),
        subject = changeset.subject(),
    );
    for diff in changeset.diffs() {
        out.push_str(&format!(
            "diff --git a/{path} b/{path}\n{body}",
            path = diff.path,
            body = diff.body
        ));
    }
    out.push_str("--\n1.7.9.5\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileDiff;

    fn sample_changeset() -> Changeset {
        Changeset::new()
            .with_id("1234567890abcdef1234567890abcdef12345678")
            .with_timestamp(1_400_000_000)
            .with_author("Jo Doe <jo@example.com>")
            .with_subject("Do something")
            .with_message("Longer explanation.")
            .with_diffs(vec![FileDiff {
                path: "foo/bar.txt".into(),
                body: "--- a/foo/bar.txt\n+++ b/foo/bar.txt\n@@ -1 +1 @@\n-a\n+b\n".into(),
            }])
    }

    #[test]
    fn test_render_mailbox_patch_shape() {
        let patch = render_mailbox_patch(&sample_changeset(), true);
        assert!(patch.starts_with(
            "From 1234567890abcdef1234567890abcdef12345678 Mon Sep 17 00:00:00 2001\n"
        ));
        assert!(patch.contains("From: Jo Doe <jo@example.com>\n"));
        assert!(patch.contains("Subject: [PATCH] Do something\n"));
        assert!(patch.contains("\n---\n\ndiff --git a/foo/bar.txt b/foo/bar.txt\n"));
        assert!(patch.ends_with("--\n1.7.9.5\n"));
    }

    #[test]
    fn test_message_lines_confusable_with_patch_are_escaped() {
        let changeset = sample_changeset()
            .with_message("summary\n---\ndiff -u is mentioned\nIndex: of something\n--- x");
        let patch = render_mailbox_patch(&changeset, true);
        // A `---` line's match consumes the following newline plus one
        // character, so the line right after an escaped `---` keeps its
        // original form.
        assert!(patch.contains("summary\n ---\ndiff -u is mentioned\n Index: of something\n --- x"));
    }

    #[test]
    fn test_no_escape_for_hg_render() {
        let changeset = sample_changeset().with_message("---\nliteral");
        let patch = render_mailbox_patch(&changeset, false);
        assert!(patch.contains("\n\n---\nliteral\n---\n\n"));
    }

    #[test]
    fn test_render_parse_render_is_stable() {
        let changeset = sample_changeset();
        let rendered = render_mailbox_patch(&changeset, true);

        // Split the mailbox back into envelope and patch body the way the
        // backends hand them to the parser.
        let separator = "\n---\n\n";
        let idx = rendered.find(separator).unwrap();
        let (header, body) = (&rendered[..idx], &rendered[idx + separator.len()..]);
        let reparsed = GitRepo::changeset_from_exported_patch(header, body)
            .unwrap()
            .with_id(changeset.id());

        assert_eq!(render_mailbox_patch(&reparsed, true), rendered);
    }

    #[test]
    fn test_commit_message_joins_subject_and_body() {
        assert_eq!(
            commit_message(&sample_changeset()),
            "Do something\n\nLonger explanation."
        );
        let no_body = Changeset::new().with_subject("Only subject");
        assert_eq!(commit_message(&no_body), "Only subject");
    }

    #[test]
    fn test_open_unrecognized_repo() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_source(dir.path(), "master", Tracer::default());
        assert!(matches!(result, Err(RepoError::UnrecognizedRepo(_))));
    }
}
