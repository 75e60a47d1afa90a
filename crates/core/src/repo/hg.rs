//! Mercurial repository backend.
//!
//! Drives an hg working copy through the `hg` CLI with `HGPLAIN=1` so
//! user aliases and localization can't change output formats. Server-side
//! hg commands occasionally fail once and succeed on rerun, so every
//! command gets one retry except `patch`, which must never be rerun (a
//! rerun would bury the real apply error).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use std::sync::OnceLock;

use crate::changeset::{Changeset, FileDiff};
use crate::errors::{RepoError, ShellError};
use crate::lock::ScopedLock;
use crate::patch::{parse_diff_block, parse_hg_diff_block, split_hg_patch, split_patch};
use crate::repo::{
    commit_message, render_mailbox_patch, DestinationRepo, Export, Repo, SourceRepo, Tracer,
};
use crate::shell::ShellCommand;
use crate::tempdir::ScopedTempDir;

const HEADER_TEMPLATE: &str = "# User {author}\n# Date {date}\n# Node ID {node}\n{desc}";

fn source_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^ *fbshipit-source-id: ([a-z0-9]+)$").expect("static regex")
    })
}

fn rename_or_copy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:rename|copy) (?:from|to) (.+)$").expect("static regex")
    })
}

fn old_mode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^old mode").expect("static regex"))
}

/// An hg working copy bound to one bookmark.
#[derive(Debug)]
pub struct HgRepo {
    path: PathBuf,
    branch: String,
    lock: ScopedLock,
    tracer: Tracer,
}

impl HgRepo {
    /// Open an existing checkout. Probes with `hg root`; holds a shared
    /// lock on the repository for the lifetime of the handle.
    pub fn open(path: &Path, branch: &str, tracer: Tracer) -> Result<Self, RepoError> {
        let repo = Self {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            lock: ScopedLock::create_shared_for_repo(path)?,
            tracer,
        };
        if repo.hg(["root"]).is_err() {
            return Err(RepoError::WrongRepoType {
                vcs: "hg",
                path: path.display().to_string(),
            });
        }
        Ok(repo)
    }

    fn hg<I>(&self, args: I) -> Result<String, RepoError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.hg_pipe(None, args)
    }

    fn hg_pipe<I>(&self, stdin: Option<&str>, args: I) -> Result<String, RepoError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let retries = match args.first().map(String::as_str) {
            Some("patch") => 0,
            _ => 1,
        };
        let mut command = ShellCommand::new(&self.path, "hg", args)
            .env_vars([("HGPLAIN".to_string(), "1".to_string())])
            .retries(retries);
        if let Some(input) = stdin {
            self.tracer.trace_shell_input(input);
            command = command.stdin(input.as_bytes().to_vec());
        }
        if self.tracer.shell_output {
            command = command.output_to_screen();
        }
        self.tracer.trace_shell(&command.command_string());
        Ok(command.run()?.stdout())
    }

    fn validate_revision(&self, rev: &str) -> Result<(), RepoError> {
        if rev.len() != 40 || !rev.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RepoError::InvalidRevisionId(rev.to_string()));
        }
        Ok(())
    }

    /// Parse the `# User` / `# Date` envelope plus description produced by
    /// [`HEADER_TEMPLATE`]. The first non-comment line is the subject.
    fn parse_header(header: &str) -> Changeset {
        let mut changeset = Changeset::new();
        let mut subject: Option<&str> = None;
        let mut message = String::new();
        for line in header.split('\n') {
            if line.is_empty() {
                message.push('\n');
                continue;
            }
            if line.starts_with('#') {
                if let Some(author) = strip_prefix_ignore_case(line, "# User ") {
                    changeset = changeset.with_author(author);
                } else if let Some(date) = strip_prefix_ignore_case(line, "# Date ") {
                    changeset = changeset.with_timestamp(leading_int(date));
                }
                continue;
            }
            if subject.is_none() {
                subject = Some(line);
                continue;
            }
            message.push_str(line);
            message.push('\n');
        }
        changeset
            .with_subject(subject.unwrap_or_default())
            .with_message(message.trim())
    }

    /// Build a changeset from a separated header and `{diff()}` body.
    pub fn changeset_from_exported_patch(
        header: &str,
        patch: &str,
    ) -> Result<Changeset, RepoError> {
        let mut diffs = Vec::new();
        for region in split_hg_patch(patch) {
            diffs.push(parse_hg_diff_block(&region)?);
        }
        Ok(Self::parse_header(header).with_diffs(diffs))
    }

    /// Paths whose diffs can't be consumed as plain per-file patches:
    /// rename/copy sources and targets, and mode changes.
    fn paths_needing_git_diff(patch: &str, diffs: &[FileDiff]) -> BTreeSet<String> {
        let mut needs_git: BTreeSet<String> = rename_or_copy_re()
            .captures_iter(patch)
            .map(|captures| captures[1].to_string())
            .collect();
        needs_git.extend(
            diffs
                .iter()
                .filter(|diff| old_mode_re().is_match(&diff.body))
                .map(|diff| diff.path.clone()),
        );
        needs_git
    }

    /// Regenerate diffs for `files` by checking out both sides of `rev`
    /// into sibling `a`/`b` directories and diffing them with git, which
    /// produces independent full diffs instead of rename/copy shorthand.
    fn make_diffs_using_git(
        &self,
        rev: &str,
        files: &BTreeSet<String>,
    ) -> Result<Vec<FileDiff>, RepoError> {
        let temp_dir = ScopedTempDir::new("git-wd")?;
        let path = temp_dir.path();

        self.checkout_files_at_rev_to_path(files, &format!("{rev}^"), &path.join("a"))?;
        self.checkout_files_at_rev_to_path(files, rev, &path.join("b"))?;

        let result = ShellCommand::new(
            path,
            "git",
            ["diff", "--binary", "--no-prefix", "--no-renames", "a", "b"],
        )
        .no_exceptions()
        .run()?;

        // Exit 1 means a non-empty diff; anything else means the two
        // checkouts didn't differ the way the patch said they would.
        if result.exit_code() != 1 {
            return Err(RepoError::Shell(ShellError::CommandFailed {
                command: format!("git diff --binary --no-prefix --no-renames a b (for {rev})"),
                exit_code: result.exit_code(),
                stdout: result.stdout(),
                stderr: result.stderr(),
            }));
        }

        let patch = result.stdout();
        let mut diffs = Vec::new();
        for block in split_patch(&patch) {
            diffs.push(parse_diff_block(&block?)?);
        }
        Ok(diffs)
    }

    fn checkout_files_at_rev_to_path(
        &self,
        files: &BTreeSet<String>,
        rev: &str,
        path: &Path,
    ) -> Result<(), RepoError> {
        // Pattern list goes via stdin; a long file list on the command
        // line can exceed the system's exec argument limit.
        let patterns = files
            .iter()
            .map(|file| format!("path:{file}"))
            .collect::<Vec<_>>()
            .join("\n");

        // Prefetch is needed for reasonable performance with the remote
        // file log extension; not all repos are shallow, so failure is fine.
        let mut exclusive = self.lock.get_exclusive()?;
        let _ = self.hg_pipe(
            Some(&patterns),
            ["prefetch", "-r", rev, "listfile:/dev/stdin"],
        );
        exclusive.release()?;

        let dest = path.display().to_string();
        self.hg_pipe(
            Some(&patterns),
            ["archive", "-r", rev, "-I", "listfile:/dev/stdin", dest.as_str()],
        )?;
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Leading integer of an hg `{date}` value such as `1400000000.018000`.
fn leading_int(s: &str) -> i64 {
    let digits: String = s
        .chars()
        .enumerate()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(_, c)| c)
        .collect();
    digits.parse().unwrap_or(0)
}

impl Repo for HgRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    fn update_branch_to(&self, base_rev: &str) -> Result<(), RepoError> {
        self.hg(["bookmark", "--force", "--rev", base_rev, self.branch.as_str()])?;
        self.hg(["update", self.branch.as_str()])?;
        Ok(())
    }

    fn clean(&self) -> Result<(), RepoError> {
        self.hg(["purge", "--all"])?;
        Ok(())
    }

    fn pull(&self) -> Result<(), RepoError> {
        self.tracer
            .trace_fetch(&format!("updating checkout in {}", self.path.display()));
        let _exclusive = self.lock.get_exclusive()?;
        self.hg(["pull"])?;
        Ok(())
    }

    fn head_changeset(&self) -> Result<Option<Changeset>, RepoError> {
        let log = self.hg([
            "log",
            "--limit",
            "1",
            "-r",
            self.branch.as_str(),
            "--template",
            r"{node}\n",
        ])?;
        let rev = log.trim();
        if rev.is_empty() {
            return Ok(None);
        }
        self.validate_revision(rev)?;
        self.changeset_from_id(rev)
    }
}

impl SourceRepo for HgRepo {
    fn find_next_commit(
        &self,
        revision: &str,
        roots: &[String],
    ) -> Result<Option<String>, RepoError> {
        let mut args = vec![
            "log".to_string(),
            "--limit".to_string(),
            "1".to_string(),
            "-r".to_string(),
            format!("({revision}::{branch}) - {revision}", branch = self.branch),
            "--template".to_string(),
            r"{node}\n".to_string(),
        ];
        args.extend(roots.iter().cloned());
        let log = self.hg(args)?;
        let rev = log.trim();
        if rev.is_empty() {
            return Ok(None);
        }
        self.validate_revision(rev)?;
        Ok(Some(rev.to_string()))
    }

    fn changeset_from_id(&self, revision: &str) -> Result<Option<Changeset>, RepoError> {
        let header = self.native_header_from_id(revision)?;
        let patch = self.native_patch_from_id(revision)?;
        let mut changeset = Self::changeset_from_exported_patch(&header, &patch)?;

        // Rename/copy shorthand refers to a file outside its own diff, and
        // a filter dropping one side of the pair would corrupt the other.
        // Mode-change-only diffs have the same problem once the content
        // half is filtered. Regenerate all of those as plain full diffs.
        let needs_git = Self::paths_needing_git_diff(&patch, changeset.diffs());
        if !needs_git.is_empty() {
            let mut diffs: Vec<FileDiff> = changeset
                .diffs()
                .iter()
                .filter(|diff| !needs_git.contains(&diff.path))
                .cloned()
                .collect();
            diffs.extend(self.make_diffs_using_git(revision, &needs_git)?);
            changeset = changeset.with_diffs(diffs);
        }

        Ok(Some(changeset.with_id(revision)))
    }

    fn native_patch_from_id(&self, revision: &str) -> Result<String, RepoError> {
        self.hg([
            "log",
            "--config",
            "diff.git=True",
            "-r",
            revision,
            "--encoding",
            "UTF-8",
            "--template",
            "{diff()}",
        ])
    }

    fn native_header_from_id(&self, revision: &str) -> Result<String, RepoError> {
        self.hg([
            "log",
            "--config",
            "diff.git=True",
            "-r",
            revision,
            "--encoding",
            "UTF-8",
            "--template",
            HEADER_TEMPLATE,
        ])
    }

    fn export(&self, roots: &[String], rev: Option<&str>) -> Result<Export, RepoError> {
        let revision = match rev {
            Some(rev) => rev.to_string(),
            None => self
                .hg(["log", "-r", self.branch.as_str(), "-T", "{node}"])?
                .trim()
                .to_string(),
        };

        let temp_dir = ScopedTempDir::new("hg-export")?;
        let files: BTreeSet<String> = roots.iter().cloned().collect();
        self.checkout_files_at_rev_to_path(&files, &revision, temp_dir.path())?;
        Ok(Export { temp_dir, revision })
    }
}

impl DestinationRepo for HgRepo {
    fn find_last_source_commit(&self, roots: &[String]) -> Result<Option<String>, RepoError> {
        let mut args = vec![
            "log".to_string(),
            "--limit".to_string(),
            "1".to_string(),
            "--keyword".to_string(),
            "fbshipit-source-id: ".to_string(),
            "--template".to_string(),
            "{desc}".to_string(),
        ];
        args.extend(roots.iter().cloned());
        let log = self.hg(args)?;
        Ok(source_id_re()
            .captures(log.trim())
            .map(|captures| captures[1].to_string()))
    }

    fn render_patch(&self, changeset: &Changeset) -> String {
        render_mailbox_patch(changeset, false)
    }

    fn commit_patch(&self, changeset: &Changeset) -> Result<String, RepoError> {
        let _exclusive = self.lock.get_exclusive()?;

        if changeset.diffs().is_empty() {
            // `hg patch` rejects an empty patch, so commit directly.
            let date = format!("{} 0", changeset.timestamp());
            let message = commit_message(changeset);
            self.hg([
                "--config",
                "ui.allowemptycommit=True",
                "commit",
                "--user",
                changeset.author(),
                "--date",
                date.as_str(),
                "-m",
                message.as_str(),
            ])?;
        } else {
            let patch = self.render_patch(changeset);
            if let Err(e) = self.hg_pipe(Some(&patch), ["patch", "-"]) {
                // A failed `hg patch` can leave partially applied files in
                // the working copy.
                let _ = self.hg(["update", "--clean", "."]);
                return Err(match e {
                    RepoError::Shell(source) => RepoError::ApplyFailed {
                        id: changeset.id().to_string(),
                        source,
                    },
                    other => other,
                });
            }
        }

        let id = self
            .hg(["log", "--limit", "1", "-r", ".", "--template", r"{node}\n"])?
            .trim()
            .to_string();
        self.validate_revision(&id)?;
        Ok(id)
    }

    fn push(&self) -> Result<(), RepoError> {
        self.hg(["push", "--branch", self.branch.as_str()])?;
        Ok(())
    }
}
