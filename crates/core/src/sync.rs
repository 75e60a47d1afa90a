//! The synchronization engine.
//!
//! Walks source history forward from the resume point, runs every commit
//! through the caller-supplied filter, and applies the survivors to the
//! destination. Progress lines (`  OK`, `  SKIP`) go to stdout; they are
//! the user-facing contract of a sync run, distinct from `tracing`
//! diagnostics.

use std::path::Path;

use serde_json::json;
use tracing::info;

use crate::changeset::Changeset;
use crate::config::BaseConfig;
use crate::errors::{RepoError, SyncError};
use crate::repo::{open_destination, open_source, DestinationRepo, SourceRepo, Tracer};

/// Commit filter: rewrites (or empties) each source changeset before it is
/// applied to the destination.
pub type Filter = Box<dyn Fn(&BaseConfig, Changeset) -> Changeset>;

/// A filter that passes every changeset through unchanged.
pub fn identity_filter() -> Filter {
    Box::new(|_config, changeset| changeset)
}

/// Append the tracking footer recording which source commit a destination
/// commit mirrors. This footer is what makes sync runs resumable.
pub fn add_tracking_data(changeset: Changeset, rev: Option<&str>) -> Changeset {
    let rev = rev.unwrap_or_else(|| changeset.id()).to_string();
    let message = format!("{}\n\nfbshipit-source-id: {rev}", changeset.message());
    let message = message.trim().to_string();
    changeset.with_message(message)
}

/// One-way sync of pending commits from a source repo to a destination
/// repo.
pub struct SyncEngine {
    config: BaseConfig,
    filter: Filter,
    source: Box<dyn SourceRepo>,
    destination: Box<dyn DestinationRepo>,
}

impl SyncEngine {
    /// Open both repositories named by `config` and build an engine.
    pub fn from_config(config: BaseConfig, filter: Filter) -> Result<Self, RepoError> {
        let tracer = if config.verbose {
            Tracer::standard()
        } else {
            Tracer::default()
        };
        let source = open_source(&config.source.path, &config.source.branch, tracer)?;
        let destination =
            open_destination(&config.destination.path, &config.destination.branch, tracer)?;
        Ok(Self::with_repos(config, filter, source, destination))
    }

    /// Build an engine over already-open repositories.
    pub fn with_repos(
        config: BaseConfig,
        filter: Filter,
        source: Box<dyn SourceRepo>,
        destination: Box<dyn DestinationRepo>,
    ) -> Self {
        Self {
            config,
            filter,
            source,
            destination,
        }
    }

    /// The source commit recorded by the newest tracking footer in the
    /// destination.
    fn find_last_synced_commit(&self) -> Result<String, SyncError> {
        self.destination
            .find_last_source_commit(&self.config.destination.roots)?
            .ok_or(SyncError::NoSyncedCommit)
    }

    /// The first source commit this run should apply, or `None` when the
    /// destination is already up to date.
    fn first_source_id(&self) -> Result<Option<String>, SyncError> {
        if let Some(first) = &self.config.sync.first_commit {
            return Ok(Some(first.clone()));
        }
        let last_synced = self.find_last_synced_commit()?;
        Ok(self
            .source
            .find_next_commit(&last_synced, &self.config.source.roots)?)
    }

    /// All pending source changesets, oldest first.
    fn source_changesets(&self) -> Result<Vec<Changeset>, SyncError> {
        let mut changesets = Vec::new();
        let mut rev = self.first_source_id()?;
        while let Some(current) = rev {
            let changeset = self
                .source
                .changeset_from_id(&current)?
                .ok_or_else(|| SyncError::ChangesetUnavailable(current.clone()))?;
            changesets.push(changeset);
            rev = self
                .source
                .find_next_commit(&current, &self.config.source.roots)?;
        }
        Ok(changesets)
    }

    /// Run each pending changeset through skip rules and the filter, and
    /// stamp survivors with their tracking footer.
    fn filtered_changesets(&self) -> Result<Vec<Changeset>, SyncError> {
        let skipped_ids = &self.config.sync.skip_source_commits;
        let mut changesets = Vec::new();
        for changeset in self.source_changesets()? {
            let skip_match = skipped_ids
                .iter()
                .find(|skip_id| changeset.id().starts_with(skip_id.as_str()));
            if let Some(skip_id) = skip_match {
                let message = format!(
                    "USER SKIPPED COMMIT: id \"{}\" matches \"{}\"",
                    changeset.id(),
                    skip_id
                );
                changesets.push(changeset.with_diffs(Vec::new()).with_debug_message(message));
                continue;
            }

            let changeset = (self.filter)(&self.config, changeset);
            if changeset.diffs().is_empty() {
                changesets.push(changeset.with_debug_message("SKIPPED COMMIT: no matching files"));
            } else {
                changesets.push(add_tracking_data(changeset, None));
            }
        }
        Ok(changesets)
    }

    /// Perform the sync. Applies every pending commit in order; the first
    /// apply failure aborts the run.
    pub fn run(&self) -> Result<(), SyncError> {
        let changesets = self.filtered_changesets()?;
        if changesets.is_empty() {
            println!("  No new commits to sync.");
            self.maybe_log_stats(&[], &[])?;
            return Ok(());
        }

        let patches_dir = self.config.sync.patches_directory.as_deref();
        if let Some(dir) = patches_dir {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for mut changeset in changesets {
            if let Some(dir) = patches_dir {
                changeset = self.save_patch_file(dir, changeset)?;
            }

            if self.config.verbose {
                changeset.dump_debug_messages();
            }

            if !changeset.is_valid() {
                println!("  SKIP {} {}", changeset.short_id(), changeset.subject());
                skipped.push(changeset);
                continue;
            }

            match self.destination.commit_patch(&changeset) {
                Ok(_) => {
                    println!("  OK {} {}", changeset.short_id(), changeset.subject());
                    applied.push(changeset);
                }
                Err(e) => {
                    eprintln!(
                        "Failed to apply patch {} ({}): {}",
                        changeset.id(),
                        changeset.message(),
                        e
                    );
                    return Err(e.into());
                }
            }
        }

        info!(
            applied = applied.len(),
            skipped = skipped.len(),
            "sync run complete"
        );
        self.maybe_log_stats(&applied, &skipped)?;
        Ok(())
    }

    fn save_patch_file(&self, dir: &Path, changeset: Changeset) -> Result<Changeset, SyncError> {
        let file = dir.join(format!(
            "{}-{}.patch",
            self.config.destination.branch,
            changeset.id()
        ));
        if file.exists() {
            println!("Overwriting patch file: {}", file.display());
        }
        std::fs::write(&file, self.destination.render_patch(&changeset))?;
        Ok(changeset.with_debug_message(format!("Saved patch file: {}", file.display())))
    }

    /// Write the JSON stats record, if a stats file is configured.
    fn maybe_log_stats(
        &self,
        applied: &[Changeset],
        skipped: &[Changeset],
    ) -> Result<(), SyncError> {
        let Some(configured) = &self.config.sync.stats_file else {
            return Ok(());
        };
        // A directory means one stats file per destination branch.
        let filename = if configured.is_dir() {
            configured.join(format!(
                "{}.json",
                namesafe_branch(&self.config.destination.branch)
            ))
        } else {
            configured.clone()
        };

        let source_head = self.source.head_changeset()?;
        let destination_head = self.destination.head_changeset()?;
        let stats = json!({
            "source": {
                "id": source_head.as_ref().map(Changeset::id),
                "timestamp": source_head.as_ref().map(Changeset::timestamp),
                "branch": self.config.source.branch,
            },
            "destination": {
                "id": destination_head.as_ref().map(Changeset::id),
                "timestamp": destination_head.as_ref().map(Changeset::timestamp),
                "branch": self.config.destination.branch,
            },
            "changesets": applied.iter().map(Changeset::id).collect::<Vec<_>>(),
            "skipped": skipped.iter().map(Changeset::id).collect::<Vec<_>>(),
        });
        std::fs::write(&filename, stats.to_string())?;
        Ok(())
    }
}

/// Slashes are allowed in branch names but not in filenames.
fn namesafe_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileDiff;
    use crate::config::{EndpointConfig, SyncOptions};
    use crate::errors::RepoError;
    use crate::repo::{Export, Repo};
    use crate::tempdir::ScopedTempDir;
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    fn changeset(id: &str, subject: &str) -> Changeset {
        Changeset::new()
            .with_id(id)
            .with_timestamp(1_400_000_000)
            .with_author("A <a@b.c>")
            .with_subject(subject)
            .with_message("body")
            .with_diffs(vec![FileDiff {
                path: format!("src/{id}.txt"),
                body: "new file mode 100644\n--- /dev/null\n+++ b/x\n@@ -0,0 +1 @@\n+x\n".into(),
            }])
    }

    fn config() -> BaseConfig {
        BaseConfig {
            source: EndpointConfig {
                path: PathBuf::from("/nonexistent/source"),
                branch: "master".into(),
                roots: Vec::new(),
            },
            destination: EndpointConfig {
                path: PathBuf::from("/nonexistent/destination"),
                branch: "main".into(),
                roots: Vec::new(),
            },
            sync: SyncOptions::default(),
            verbose: false,
        }
    }

    struct MockSource {
        commits: Vec<Changeset>,
        path: PathBuf,
    }

    impl Repo for MockSource {
        fn path(&self) -> &Path {
            &self.path
        }
        fn branch(&self) -> &str {
            "master"
        }
        fn update_branch_to(&self, _base_rev: &str) -> Result<(), RepoError> {
            Ok(())
        }
        fn clean(&self) -> Result<(), RepoError> {
            Ok(())
        }
        fn pull(&self) -> Result<(), RepoError> {
            Ok(())
        }
        fn head_changeset(&self) -> Result<Option<Changeset>, RepoError> {
            Ok(self.commits.last().cloned())
        }
    }

    impl SourceRepo for MockSource {
        fn find_next_commit(
            &self,
            revision: &str,
            _roots: &[String],
        ) -> Result<Option<String>, RepoError> {
            let pos = self.commits.iter().position(|c| c.id() == revision);
            Ok(pos
                .and_then(|i| self.commits.get(i + 1))
                .map(|c| c.id().to_string()))
        }
        fn changeset_from_id(&self, revision: &str) -> Result<Option<Changeset>, RepoError> {
            Ok(self.commits.iter().find(|c| c.id() == revision).cloned())
        }
        fn native_patch_from_id(&self, _revision: &str) -> Result<String, RepoError> {
            Ok(String::new())
        }
        fn native_header_from_id(&self, _revision: &str) -> Result<String, RepoError> {
            Ok(String::new())
        }
        fn export(&self, _roots: &[String], rev: Option<&str>) -> Result<Export, RepoError> {
            Ok(Export {
                temp_dir: ScopedTempDir::new("mock-export")?,
                revision: rev.unwrap_or("head").to_string(),
            })
        }
    }

    struct MockDestination {
        last_source_commit: Option<String>,
        applied: Rc<RefCell<Vec<Changeset>>>,
        path: PathBuf,
    }

    impl Repo for MockDestination {
        fn path(&self) -> &Path {
            &self.path
        }
        fn branch(&self) -> &str {
            "main"
        }
        fn update_branch_to(&self, _base_rev: &str) -> Result<(), RepoError> {
            Ok(())
        }
        fn clean(&self) -> Result<(), RepoError> {
            Ok(())
        }
        fn pull(&self) -> Result<(), RepoError> {
            Ok(())
        }
        fn head_changeset(&self) -> Result<Option<Changeset>, RepoError> {
            Ok(self.applied.borrow().last().cloned())
        }
    }

    impl DestinationRepo for MockDestination {
        fn find_last_source_commit(
            &self,
            _roots: &[String],
        ) -> Result<Option<String>, RepoError> {
            Ok(self.last_source_commit.clone())
        }
        fn render_patch(&self, changeset: &Changeset) -> String {
            crate::repo::render_mailbox_patch(changeset, true)
        }
        fn commit_patch(&self, changeset: &Changeset) -> Result<String, RepoError> {
            self.applied.borrow_mut().push(changeset.clone());
            Ok(format!("dest{}", self.applied.borrow().len()))
        }
        fn push(&self) -> Result<(), RepoError> {
            Ok(())
        }
    }

    fn engine(
        config: BaseConfig,
        filter: Filter,
        commits: Vec<Changeset>,
        last_synced: Option<&str>,
    ) -> (SyncEngine, Rc<RefCell<Vec<Changeset>>>) {
        let applied = Rc::new(RefCell::new(Vec::new()));
        let source = MockSource {
            commits,
            path: PathBuf::from("/nonexistent/source"),
        };
        let destination = MockDestination {
            last_source_commit: last_synced.map(str::to_string),
            applied: Rc::clone(&applied),
            path: PathBuf::from("/nonexistent/destination"),
        };
        (
            SyncEngine::with_repos(config, filter, Box::new(source), Box::new(destination)),
            applied,
        )
    }

    #[test]
    fn test_resumes_after_last_synced_commit() {
        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "second"),
            changeset("ccc3333", "third"),
        ];
        let (engine, applied) = engine(config(), identity_filter(), commits, Some("aaa1111"));
        engine.run().unwrap();

        let applied = applied.borrow();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].id(), "bbb2222");
        assert_eq!(applied[1].id(), "ccc3333");
        assert!(applied[0]
            .message()
            .ends_with("fbshipit-source-id: bbb2222"));
    }

    #[test]
    fn test_no_synced_commit_is_fatal() {
        let (engine, _) = engine(
            config(),
            identity_filter(),
            vec![changeset("aaa1111", "first")],
            None,
        );
        assert!(matches!(engine.run(), Err(SyncError::NoSyncedCommit)));
    }

    #[test]
    fn test_first_commit_overrides_resume_discovery() {
        let mut config = config();
        config.sync.first_commit = Some("bbb2222".into());
        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "second"),
        ];
        // No tracking footer exists anywhere, but first_commit avoids the
        // lookup entirely.
        let (engine, applied) = engine(config, identity_filter(), commits, None);
        engine.run().unwrap();
        assert_eq!(applied.borrow().len(), 1);
        assert_eq!(applied.borrow()[0].id(), "bbb2222");
    }

    #[test]
    fn test_user_skipped_commits_are_emptied() {
        let mut config = config();
        config.sync.skip_source_commits = vec!["bbb".into()];
        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "second"),
            changeset("ccc3333", "third"),
        ];
        let (engine, applied) = engine(config, identity_filter(), commits, Some("aaa1111"));
        engine.run().unwrap();

        let applied = applied.borrow();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id(), "ccc3333");
    }

    #[test]
    fn test_filter_emptying_diffs_skips_commit() {
        let filter: Filter = Box::new(|_config, changeset| {
            if changeset.subject() == "internal only" {
                changeset.with_diffs(Vec::new())
            } else {
                changeset
            }
        });
        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "internal only"),
            changeset("ccc3333", "third"),
        ];
        let (engine, applied) = engine(config(), filter, commits, Some("aaa1111"));
        engine.run().unwrap();

        let applied = applied.borrow();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id(), "ccc3333");
    }

    #[test]
    fn test_stats_file_records_applied_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("stats.json");
        let mut config = config();
        config.sync.stats_file = Some(stats_path.clone());
        config.sync.skip_source_commits = vec!["ccc".into()];

        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "second"),
            changeset("ccc3333", "third"),
        ];
        let (engine, _) = engine(config, identity_filter(), commits, Some("aaa1111"));
        engine.run().unwrap();

        let stats: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&stats_path).unwrap()).unwrap();
        assert_eq!(stats["changesets"], json!(["bbb2222"]));
        assert_eq!(stats["skipped"], json!(["ccc3333"]));
        assert_eq!(stats["source"]["branch"], "master");
        assert_eq!(stats["destination"]["id"], json!("bbb2222"));
    }

    #[test]
    fn test_stats_directory_uses_namesafe_branch_filename() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.destination.branch = "releases/v1.0".into();
        config.sync.stats_file = Some(dir.path().to_path_buf());

        let (engine, _) = engine(
            config,
            identity_filter(),
            vec![changeset("aaa1111", "first")],
            Some("aaa1111"),
        );
        engine.run().unwrap();
        assert!(dir.path().join("releases_v1.0.json").exists());
    }

    #[test]
    fn test_patches_directory_gets_one_file_per_changeset() {
        let dir = tempfile::tempdir().unwrap();
        let patches = dir.path().join("patches");
        let mut config = config();
        config.sync.patches_directory = Some(patches.clone());

        let commits = vec![
            changeset("aaa1111", "first"),
            changeset("bbb2222", "second"),
        ];
        let (engine, _) = engine(config, identity_filter(), commits, Some("aaa1111"));
        engine.run().unwrap();
        assert!(patches.join("main-bbb2222.patch").exists());
    }

    #[test]
    fn test_tracking_footer_not_duplicated_by_trim() {
        let changeset = Changeset::new().with_id("abc").with_message("");
        let tracked = add_tracking_data(changeset, None);
        assert_eq!(tracked.message(), "fbshipit-source-id: abc");

        let explicit = add_tracking_data(Changeset::new().with_message("msg"), Some("def"));
        assert_eq!(explicit.message(), "msg\n\nfbshipit-source-id: def");
    }

    #[test]
    fn test_namesafe_branch() {
        assert_eq!(namesafe_branch("main"), "main");
        assert_eq!(namesafe_branch("releases/v1.0"), "releases_v1.0");
        assert_eq!(namesafe_branch("weird branch!"), "weird_branch_");
    }
}
