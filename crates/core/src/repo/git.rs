//! Git repository backend.
//!
//! Drives a git working copy through the `git` CLI. Every invocation runs
//! with `GIT_CONFIG_NOSYSTEM=1` and `HOME` pointed at a throwaway
//! directory, so per-user and system gitconfig can never change behavior
//! between machines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use regex_lite::Regex;
use std::sync::OnceLock;

use crate::changeset::Changeset;
use crate::errors::RepoError;
use crate::lock::ScopedLock;
use crate::patch::{parse_diff_block, split_patch};
use crate::repo::{
    commit_message, render_mailbox_patch, DestinationRepo, Export, Repo, SourceRepo, Tracer,
};
use crate::shell::ShellCommand;
use crate::tempdir::ScopedTempDir;

fn source_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^ *(?:fb)?shipit-source-id: ([a-z0-9]+)$").expect("static regex")
    })
}

#[derive(Debug)]
struct SubmoduleSpec {
    name: String,
    path: String,
    url: String,
}

/// A git working copy bound to one branch.
#[derive(Debug)]
pub struct GitRepo {
    path: PathBuf,
    branch: String,
    lock: ScopedLock,
    fake_home: ScopedTempDir,
    tracer: Tracer,
}

impl GitRepo {
    /// Open an existing checkout and switch it to `branch`. Holds a shared
    /// lock on the repository for the lifetime of the handle.
    pub fn open(path: &Path, branch: &str, tracer: Tracer) -> Result<Self, RepoError> {
        if !path.join(".git").exists() {
            return Err(RepoError::WrongRepoType {
                vcs: "git",
                path: path.display().to_string(),
            });
        }
        let repo = Self {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            lock: ScopedLock::create_shared_for_repo(path)?,
            fake_home: ScopedTempDir::new("fake-home-for-git")?,
            tracer,
        };
        repo.git(["checkout", branch])?;
        Ok(repo)
    }

    fn git<I>(&self, args: I) -> Result<String, RepoError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Ok(self.git_raw(None, args)?.stdout())
    }

    fn git_pipe<I>(&self, stdin: &str, args: I) -> Result<String, RepoError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Ok(self.git_raw(Some(stdin), args)?.stdout())
    }

    fn git_raw<I>(
        &self,
        stdin: Option<&str>,
        args: I,
    ) -> Result<crate::shell::ShellCommandResult, RepoError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if !self.path.join(".git").exists() {
            return Err(RepoError::WrongRepoType {
                vcs: "git",
                path: self.path.display().to_string(),
            });
        }
        let mut command = ShellCommand::new(&self.path, "git", args).env_vars([
            ("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string()),
            (
                "HOME".to_string(),
                self.fake_home.path().display().to_string(),
            ),
        ]);
        if let Some(input) = stdin {
            self.tracer.trace_shell_input(input);
            command = command.stdin(input.as_bytes().to_vec());
        }
        if self.tracer.shell_output {
            command = command.output_to_screen();
        }
        self.tracer.trace_shell(&command.command_string());
        Ok(command.run()?)
    }

    fn head_sha(&self) -> Result<String, RepoError> {
        Ok(self.git(["log", "-1", "--pretty=format:%H"])?.trim().to_string())
    }

    /// Parse the mailbox-style metadata envelope produced by
    /// `git format-patch`.
    fn parse_header(header: &str) -> Changeset {
        let trimmed = header.trim();
        let (envelope, message) = match trimmed.split_once("\n\n") {
            Some((envelope, message)) => (envelope, message.trim()),
            None => (trimmed, ""),
        };

        // Headers generated with a diffstat carry "---" and a file list
        // after the message; stat lines start with a space, which keeps a
        // literal "---" inside the message itself intact.
        let message = match message.rfind("\n---\n ") {
            Some(idx) => message[..idx].trim(),
            None => message,
        };

        let mut changeset = Changeset::new().with_message(message);

        // Unfold RFC 2822 continuation lines.
        let envelope = envelope.replace("\n\t", " ").replace("\n ", " ");
        for line in envelope.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "from" => changeset = changeset.with_author(value),
                "subject" => {
                    let value = match value.get(..8) {
                        Some(prefix) if prefix.eq_ignore_ascii_case("[PATCH] ") => {
                            value[8..].trim()
                        }
                        _ => value,
                    };
                    changeset = changeset.with_subject(value);
                }
                "date" => {
                    let timestamp = DateTime::parse_from_rfc2822(value)
                        .map(|d| d.timestamp())
                        .unwrap_or(0);
                    changeset = changeset.with_timestamp(timestamp);
                }
                _ => {}
            }
        }
        changeset
    }

    /// Build a changeset from a separated header and patch body, as
    /// produced by [`SourceRepo::native_header_from_id`] and
    /// [`SourceRepo::native_patch_from_id`].
    pub fn changeset_from_exported_patch(
        header: &str,
        patch: &str,
    ) -> Result<Changeset, RepoError> {
        let mut diffs = Vec::new();
        for block in split_patch(patch) {
            diffs.push(parse_diff_block(&block?)?);
        }
        Ok(Self::parse_header(header).with_diffs(diffs))
    }

    fn native_header_with_patch(&self, revision: &str, patch: &str) -> Result<String, RepoError> {
        let full_patch = self.git([
            "format-patch",
            "--always",
            "--no-renames",
            "--no-stat",
            "--stdout",
            "-1",
            revision,
        ])?;
        if patch.is_empty() {
            // Empty commit; everything is the header.
            return Ok(full_patch);
        }
        match full_patch.find(patch) {
            Some(idx) => Ok(full_patch[..idx].to_string()),
            None => Err(RepoError::HeaderExtraction(revision.to_string())),
        }
    }

    fn submodules(&self) -> Result<Vec<SubmoduleSpec>, RepoError> {
        if !self.path.join(".gitmodules").exists() {
            return Ok(Vec::new());
        }
        let configs = self.git(["config", "-f", ".gitmodules", "--list"])?;
        let mut paths: HashMap<String, String> = HashMap::new();
        let mut urls: HashMap<String, String> = HashMap::new();
        for line in configs.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some(rest) = key.strip_prefix("submodule.") else {
                continue;
            };
            if let Some(name) = rest.strip_suffix(".path") {
                paths.insert(name.to_string(), value.to_string());
            } else if let Some(name) = rest.strip_suffix(".url") {
                urls.insert(name.to_string(), value.to_string());
            }
        }
        let mut specs: Vec<SubmoduleSpec> = urls
            .into_iter()
            .filter_map(|(name, url)| {
                let path = paths.get(&name)?.clone();
                self.path.join(&path).exists().then_some(SubmoduleSpec {
                    name,
                    path,
                    url,
                })
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    /// `git am` records submodule pointer changes as plain file content;
    /// turn them back into real submodule updates.
    fn fix_submodules(&self) -> Result<(), RepoError> {
        for submodule in self.submodules()? {
            let status = self.git(["submodule", "status", submodule.path.as_str()])?;
            let status = status.trim_start();
            if status.is_empty() {
                // The path exists but git doesn't know it as a submodule,
                // so the patch added one.
                let full_path = self.path.join(&submodule.path);
                let contents = std::fs::read_to_string(&full_path)?;
                let sha = contents
                    .trim()
                    .strip_prefix("Subproject commit ")
                    .unwrap_or("")
                    .trim()
                    .to_string();
                self.git(["rm", submodule.path.as_str()])?;
                self.git([
                    "submodule",
                    "add",
                    "-f",
                    "--name",
                    submodule.name.as_str(),
                    submodule.url.as_str(),
                    submodule.path.as_str(),
                ])?;
                ShellCommand::new(&full_path, "git", ["checkout", sha.as_str()])
                    .run()
                    .map_err(RepoError::Shell)?;
                self.git(["add", submodule.path.as_str()])?;
                // Preserve any whitespace in the .gitmodules file.
                self.git(["checkout", "HEAD", ".gitmodules"])?;
                self.git(["commit", "--amend", "--no-edit"])?;
            } else if status.starts_with('+') {
                // A leading + on the status line means the checked-out
                // commit changed.
                self.git(["submodule", "update", "--recursive", submodule.path.as_str()])?;
            }
        }
        // Clean up any removed submodules.
        self.git(["clean", "-f", "-f", "-d"])?;
        Ok(())
    }
}

impl Repo for GitRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    fn update_branch_to(&self, base_rev: &str) -> Result<(), RepoError> {
        self.git(["checkout", "-B", self.branch.as_str(), base_rev])?;
        Ok(())
    }

    fn clean(&self) -> Result<(), RepoError> {
        self.git(["clean", "-x", "-f", "-f", "-d"])?;
        Ok(())
    }

    fn pull(&self) -> Result<(), RepoError> {
        self.tracer
            .trace_fetch(&format!("updating checkout in {}", self.path.display()));
        let _exclusive = self.lock.get_exclusive()?;
        // Any in-progress am state would make the reset fail.
        let _ = self.git(["am", "--abort"]);
        self.git(["fetch", "origin"])?;
        let upstream = format!("origin/{}", self.branch);
        self.git(["reset", "--hard", upstream.as_str()])?;
        Ok(())
    }

    fn head_changeset(&self) -> Result<Option<Changeset>, RepoError> {
        let rev = self.git(["rev-parse", self.branch.as_str()])?.trim().to_string();
        if rev.is_empty() {
            return Ok(None);
        }
        self.changeset_from_id(&rev)
    }
}

impl SourceRepo for GitRepo {
    fn find_next_commit(
        &self,
        revision: &str,
        roots: &[String],
    ) -> Result<Option<String>, RepoError> {
        let mut args = vec![
            "log".to_string(),
            format!("{revision}.."),
            "--ancestry-path".to_string(),
            "--no-merges".to_string(),
            "--format=%H".to_string(),
        ];
        if !roots.is_empty() {
            args.push("--".to_string());
            args.extend(roots.iter().cloned());
        }
        let log = self.git(args)?;
        let log = log.trim();
        if log.is_empty() {
            return Ok(None);
        }
        // Oldest commit is the last line of the newest-first log.
        let next = log
            .lines()
            .last()
            .and_then(|line| line.split(' ').next())
            .map(str::to_string);
        Ok(next)
    }

    fn changeset_from_id(&self, revision: &str) -> Result<Option<Changeset>, RepoError> {
        let patch = self.native_patch_from_id(revision)?;
        let header = self.native_header_with_patch(revision, &patch)?;
        let changeset = Self::changeset_from_exported_patch(&header, &patch)?;
        Ok(Some(changeset.with_id(revision)))
    }

    fn native_patch_from_id(&self, revision: &str) -> Result<String, RepoError> {
        // --format= leaves nothing but the code changes.
        self.git([
            "format-patch",
            "--no-renames",
            "--no-stat",
            "--stdout",
            "--format=",
            "-1",
            revision,
        ])
    }

    fn native_header_from_id(&self, revision: &str) -> Result<String, RepoError> {
        let patch = self.native_patch_from_id(revision)?;
        self.native_header_with_patch(revision, &patch)
    }

    fn export(&self, roots: &[String], rev: Option<&str>) -> Result<Export, RepoError> {
        let revision = match rev {
            Some(rev) => rev.to_string(),
            None => self.git(["rev-parse", "HEAD"])?.trim().to_string(),
        };

        let mut args = vec![
            "archive".to_string(),
            "--format=tar".to_string(),
            revision.clone(),
        ];
        args.extend(roots.iter().cloned());
        let tar = self.git_raw(None, args)?;

        let temp_dir = ScopedTempDir::new("git-export")?;
        ShellCommand::new(temp_dir.path(), "tar", ["x"])
            .stdin(tar.stdout_bytes().to_vec())
            .run()
            .map_err(RepoError::Shell)?;

        // git-archive writes submodules as empty directories; replace each
        // with the pointer file git itself would store.
        for submodule in self.submodules()? {
            let status = self.git(["submodule", "status", submodule.path.as_str()])?;
            let sha = status
                .trim_start_matches(['-', '+', 'U'])
                .split(' ')
                .next()
                .unwrap_or("")
                .to_string();
            let dest_path = temp_dir.path().join(&submodule.path);
            let _ = std::fs::remove_dir(&dest_path);
            std::fs::write(&dest_path, format!("Subproject commit {sha}"))?;
        }

        Ok(Export { temp_dir, revision })
    }
}

impl DestinationRepo for GitRepo {
    fn find_last_source_commit(&self, roots: &[String]) -> Result<Option<String>, RepoError> {
        let mut args = vec![
            "log".to_string(),
            "-1".to_string(),
            "--grep".to_string(),
            r"^\(fb\)\?shipit-source-id: [a-z0-9]\+$".to_string(),
        ];
        if !roots.is_empty() {
            args.push("--".to_string());
            args.extend(roots.iter().cloned());
        }
        let log = self.git(args)?;
        Ok(source_id_re()
            .captures(log.trim())
            .map(|captures| captures[1].to_string()))
    }

    fn render_patch(&self, changeset: &Changeset) -> String {
        render_mailbox_patch(changeset, true)
    }

    fn commit_patch(&self, changeset: &Changeset) -> Result<String, RepoError> {
        let _exclusive = self.lock.get_exclusive()?;

        if changeset.diffs().is_empty() {
            // `git am` does not handle empty commits.
            let date = changeset.timestamp().to_string();
            let message = commit_message(changeset);
            self.git([
                "commit",
                "--allow-empty",
                "--author",
                changeset.author(),
                "--date",
                date.as_str(),
                "-m",
                message.as_str(),
            ])?;
            return self.head_sha();
        }

        let patch = self.render_patch(changeset);
        if let Err(e) = self.git_pipe(&patch, ["am", "--keep-non-patch", "--keep-cr"]) {
            // Leave no half-applied am state behind.
            let _ = self.git(["am", "--abort"]);
            return Err(match e {
                RepoError::Shell(source) => RepoError::ApplyFailed {
                    id: changeset.id().to_string(),
                    source,
                },
                other => other,
            });
        }

        self.fix_submodules()?;
        self.head_sha()
    }

    fn push(&self) -> Result<(), RepoError> {
        let refspec = format!("HEAD:{}", self.branch);
        self.git(["push", "origin", refspec.as_str()])?;
        Ok(())
    }
}
