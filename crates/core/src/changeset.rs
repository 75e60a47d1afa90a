//! Repository-agnostic representation of a single commit.

/// Length of abbreviated revision ids in progress output.
pub const SHORT_REV_LENGTH: usize = 7;

/// One file's diff within a changeset: the path and the raw diff body (the
/// lines following the `diff --git a/<path> b/<path>` boundary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub body: String,
}

/// Immutable value describing one commit: metadata plus an ordered sequence
/// of per-file diffs.
///
/// The diff order is semantically meaningful: a file-to-symlink conversion
/// is two diffs for the same path, delete then create, and consumers rely
/// on that order. All mutation is copy-with-replacement via the `with_*`
/// methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    id: String,
    timestamp: i64,
    author: String,
    subject: String,
    message: String,
    diffs: Vec<FileDiff>,
    debug_messages: Vec<String>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// A changeset is valid when it has at least one diff.
    pub fn is_valid(&self) -> bool {
        !self.diffs.is_empty()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Abbreviated revision id for progress output.
    pub fn short_id(&self) -> &str {
        if self.id.len() > SHORT_REV_LENGTH {
            &self.id[..SHORT_REV_LENGTH]
        } else {
            &self.id
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Commit time in seconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Free-text author, usually `Name <email>` or the backend-native form.
    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Message body, excluding the subject and any file-list summary.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn diffs(&self) -> &[FileDiff] {
        &self.diffs
    }

    pub fn with_diffs(mut self, diffs: Vec<FileDiff>) -> Self {
        self.diffs = diffs;
        self
    }

    /// Diagnostic strings attached by filters. Never parsed, only displayed.
    pub fn debug_messages(&self) -> &[String] {
        &self.debug_messages
    }

    pub fn with_debug_message(mut self, message: impl Into<String>) -> Self {
        self.debug_messages.push(message.into());
        self
    }

    /// Print accumulated debug messages for this changeset.
    pub fn dump_debug_messages(&self) {
        println!(
            "  DEBUG {} {}\n    Full ID: {}",
            self.short_id(),
            self.subject(),
            self.id()
        );
        for message in &self.debug_messages {
            println!("    {message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_tracks_diffs() {
        let changeset = Changeset::new();
        assert!(!changeset.is_valid());

        let changeset = changeset.with_diffs(vec![FileDiff {
            path: "foo/bar.txt".into(),
            body: "new file mode 100644\n".into(),
        }]);
        assert!(changeset.is_valid());

        let emptied = changeset.with_diffs(Vec::new());
        assert!(!emptied.is_valid());
    }

    #[test]
    fn test_with_methods_do_not_mutate_original() {
        let original = Changeset::new().with_subject("first");
        let modified = original.clone().with_subject("second");
        assert_eq!(original.subject(), "first");
        assert_eq!(modified.subject(), "second");
    }

    #[test]
    fn test_short_id() {
        let changeset = Changeset::new().with_id("deadbeefcafe1234");
        assert_eq!(changeset.short_id(), "deadbee");

        let short = Changeset::new().with_id("ab12");
        assert_eq!(short.short_id(), "ab12");

        assert_eq!(Changeset::new().short_id(), "");
    }

    #[test]
    fn test_debug_messages_accumulate_in_order() {
        let changeset = Changeset::new()
            .with_debug_message("first")
            .with_debug_message("second");
        assert_eq!(changeset.debug_messages(), ["first", "second"]);
    }

    #[test]
    fn test_diff_order_preserved() {
        // delete-then-create for the same path, as in a file-to-symlink
        // conversion.
        let changeset = Changeset::new().with_diffs(vec![
            FileDiff {
                path: "link".into(),
                body: "deleted file mode 100644\n".into(),
            },
            FileDiff {
                path: "link".into(),
                body: "new file mode 120000\n".into(),
            },
        ]);
        assert_eq!(changeset.diffs()[0].body, "deleted file mode 100644\n");
        assert_eq!(changeset.diffs()[1].body, "new file mode 120000\n");
    }
}
