//! Unified-diff patch splitting.
//!
//! [`split_patch`] turns the raw concatenated output of `git diff` /
//! `git format-patch --stdout` / `hg export --git` into one text block per
//! file, each block carrying its mode/rename/index preamble and full hunk
//! bodies.
//!
//! Splitting is hunk-range aware: after a `@@ -a,b +c,d @@` header the
//! parser counts down the remaining `-` and `+` lines instead of pattern
//! matching, because file content can itself contain lines that look like
//! patch syntax (a literal `--` line, for instance). Only the range-header
//! bookkeeping can correctly delimit a hunk.

use std::iter::Peekable;
use std::str::Split;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::changeset::FileDiff;
use crate::errors::RepoError;

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -\d+(?:,(\d+))? \+\d+(?:,(\d+))? @@").expect("static regex")
    })
}

fn new_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^new file").expect("static regex"))
}

fn file_removal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^deleted file").expect("static regex"))
}

/// If `line` is a `diff --git a/<path> b/<path>` file boundary, return the
/// path. Both halves must name the same path (this is how boundaries with
/// spaces in the path stay unambiguous).
pub fn parse_boundary_line(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("diff --git ")?;
    let rest = rest.strip_prefix("a/").or_else(|| rest.strip_prefix("b/"))?;
    // The path may contain spaces; find the split where the second half
    // repeats the first.
    let mut search_from = 0;
    while let Some(rel) = rest[search_from..].find(' ') {
        let idx = search_from + rel;
        let (left, right) = (&rest[..idx], &rest[idx + 1..]);
        let right = right
            .strip_prefix("a/")
            .or_else(|| right.strip_prefix("b/"));
        if right == Some(left) {
            return Some(left);
        }
        search_from = idx + 1;
    }
    None
}

/// True if `line` opens a new file block in hg's git-style diff output.
///
/// Unlike [`parse_boundary_line`] the two halves may name different paths
/// (renames and copies) or be `/dev/null`.
pub fn is_hg_boundary_line(line: &str) -> bool {
    fn starts_half(s: &str) -> bool {
        s.starts_with("a/") || s.starts_with("b/") || s.starts_with("/dev/null")
    }
    let Some(rest) = line.trim_end().strip_prefix("diff --git ") else {
        return false;
    };
    if !starts_half(rest) {
        return false;
    }
    let mut search_from = 0;
    while let Some(rel) = rest[search_from..].find(' ') {
        let idx = search_from + rel;
        if starts_half(&rest[idx + 1..]) {
            return true;
        }
        search_from = idx + 1;
    }
    false
}

/// Extract the source path from an hg file boundary. For a rename this is
/// the old path; the caller regenerates such diffs anyway.
pub fn parse_hg_boundary_path(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("diff --git ")?;
    let rest = rest.strip_prefix("a/").or_else(|| rest.strip_prefix("b/"))?;
    let mut search_from = 0;
    while let Some(rel) = rest[search_from..].find(' ') {
        let idx = search_from + rel;
        let right = &rest[idx + 1..];
        if right.starts_with("a/") || right.starts_with("b/") {
            return Some(&rest[..idx]);
        }
        search_from = idx + 1;
    }
    None
}

/// Split hg's `{diff()}` template output into per-file regions.
///
/// hg emits no signature or other trailing junk, so a plain line-based
/// split on the file boundary is sufficient; no hunk counting needed.
pub fn split_hg_patch(patch: &str) -> Vec<String> {
    let mut regions = Vec::new();
    let mut contents = String::new();
    let mut lines = patch.split('\n').peekable();
    while let Some(line) = lines.next() {
        if line.is_empty() && lines.peek().is_none() {
            break;
        }
        if is_hg_boundary_line(line) && !contents.is_empty() {
            regions.push(std::mem::take(&mut contents));
        }
        push_line(&mut contents, line);
    }
    if !contents.is_empty() {
        regions.push(contents);
    }
    regions
}

/// Split an hg region into a [`FileDiff`].
pub fn parse_hg_diff_block(block: &str) -> Result<FileDiff, RepoError> {
    let (header, body) = block
        .split_once('\n')
        .ok_or_else(|| RepoError::PatchParse(block.to_string()))?;
    let path = parse_hg_boundary_path(header)
        .ok_or_else(|| RepoError::PatchParse(header.to_string()))?;
    Ok(FileDiff {
        path: path.to_string(),
        body: body.to_string(),
    })
}

/// True if a diff block's body marks a newly created file.
pub fn is_new_file(body: &str) -> bool {
    new_file_re().is_match(body)
}

/// True if a diff block's body marks a file removal.
pub fn is_file_removal(body: &str) -> bool {
    file_removal_re().is_match(body)
}

/// Split a diff block into a [`FileDiff`], extracting the path from the
/// boundary line and keeping everything after it as the body.
pub fn parse_diff_block(block: &str) -> Result<FileDiff, RepoError> {
    let (header, body) = block
        .split_once('\n')
        .ok_or_else(|| RepoError::PatchParse(block.to_string()))?;
    let path = parse_boundary_line(header)
        .ok_or_else(|| RepoError::PatchParse(header.to_string()))?;
    Ok(FileDiff {
        path: path.to_string(),
        body: body.to_string(),
    })
}

/// Split raw unified-diff text into per-file blocks.
///
/// Single-pass and non-restartable; each yielded block is an owned copy
/// including its boundary line. Lines between a hunk's exhaustion and the
/// next boundary that belong to no hunk (such as a `format-patch`
/// signature) are dropped.
pub fn split_patch(patch: &str) -> SplitPatch<'_> {
    SplitPatch {
        lines: patch.split('\n').peekable(),
        contents: String::new(),
        minus_lines: 0,
        plus_lines: 0,
        seen_range_header: false,
        done: false,
    }
}

/// Iterator returned by [`split_patch`].
#[derive(Debug)]
pub struct SplitPatch<'a> {
    lines: Peekable<Split<'a, char>>,
    contents: String,
    minus_lines: u64,
    plus_lines: u64,
    seen_range_header: bool,
    done: bool,
}

impl<'a> Iterator for SplitPatch<'a> {
    type Item = Result<String, RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(line) = self.lines.next() {
            // Splitting on '\n' leaves one empty segment after a trailing
            // newline; it is not a line of the patch.
            if line.is_empty() && self.lines.peek().is_none() {
                break;
            }

            if parse_boundary_line(line).is_some() {
                self.seen_range_header = false;
                if self.contents.is_empty() {
                    push_line(&mut self.contents, line);
                    continue;
                }
                let block = std::mem::take(&mut self.contents);
                push_line(&mut self.contents, line);
                return Some(Ok(block));
            }

            if let Some(captures) = hunk_header_re().captures(line) {
                self.minus_lines = range_len(captures.get(1).map(|m| m.as_str()));
                self.plus_lines = range_len(captures.get(2).map(|m| m.as_str()));
                self.seen_range_header = true;
                push_line(&mut self.contents, line);
                continue;
            }

            if !self.seen_range_header {
                // Mode/rename/index preamble before the first hunk.
                push_line(&mut self.contents, line);
                continue;
            }

            if line.starts_with('\\') {
                // "\ No newline at end of file" counts against neither
                // range; if the trailing newline changes there is a +
                // and a - for the last content line.
                push_line(&mut self.contents, line);
                continue;
            }

            if self.minus_lines == 0 && self.plus_lines == 0 {
                // Between the end of a hunk and the next range header or
                // boundary; nothing here belongs to the block.
                continue;
            }

            match line.chars().next() {
                Some('+') => self.plus_lines = self.plus_lines.saturating_sub(1),
                Some('-') => self.minus_lines = self.minus_lines.saturating_sub(1),
                Some(' ') => {
                    // Context counts against both.
                    self.plus_lines = self.plus_lines.saturating_sub(1);
                    self.minus_lines = self.minus_lines.saturating_sub(1);
                }
                _ => {
                    self.done = true;
                    return Some(Err(RepoError::PatchParse(line.to_string())));
                }
            }
            push_line(&mut self.contents, line);
        }

        self.done = true;
        if self.contents.is_empty() {
            None
        } else {
            Some(Ok(std::mem::take(&mut self.contents)))
        }
    }
}

fn push_line(contents: &mut String, line: &str) {
    contents.push_str(line);
    contents.push('\n');
}

/// An omitted range length means 1.
fn range_len(capture: Option<&str>) -> u64 {
    match capture {
        Some(digits) => digits.parse().unwrap_or(1),
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILE_DIFF: &str = "\
diff --git a/foo.txt b/foo.txt
index 0000000..1111111 100644
--- a/foo.txt
+++ b/foo.txt
@@ -1,2 +1,2 @@
 context
-old line
+new line
diff --git a/bar.txt b/bar.txt
new file mode 100644
--- /dev/null
+++ b/bar.txt
@@ -0,0 +1 @@
+only line
";

    fn split_ok(patch: &str) -> Vec<String> {
        split_patch(patch).collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn test_splits_on_file_boundaries() {
        let blocks = split_ok(TWO_FILE_DIFF);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("diff --git a/foo.txt b/foo.txt\n"));
        assert!(blocks[1].starts_with("diff --git a/bar.txt b/bar.txt\n"));
    }

    #[test]
    fn test_split_concat_round_trip() {
        let blocks = split_ok(TWO_FILE_DIFF);
        assert_eq!(blocks.concat(), TWO_FILE_DIFF);
    }

    #[test]
    fn test_literal_double_hyphen_does_not_split() {
        // File content containing a line that looks like a patch footer must
        // stay inside the single block for its path.
        let patch = "\
diff --git a/sig.txt b/sig.txt
--- a/sig.txt
+++ b/sig.txt
@@ -1,3 +1,3 @@
 before
---
+--
 after
";
        let blocks = split_ok(patch);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], patch);
    }

    #[test]
    fn test_no_newline_marker_preserved_and_not_counted() {
        let patch = "\
diff --git a/end.txt b/end.txt
--- a/end.txt
+++ b/end.txt
@@ -1 +1 @@
-old content
\\ No newline at end of file
+new content
\\ No newline at end of file
";
        let blocks = split_ok(patch);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], patch);
    }

    #[test]
    fn test_omitted_range_length_defaults_to_one() {
        let patch = "\
diff --git a/one.txt b/one.txt
--- a/one.txt
+++ b/one.txt
@@ -1 +1 @@
-a
+b
";
        assert_eq!(split_ok(patch).len(), 1);
    }

    #[test]
    fn test_unclassifiable_hunk_line_is_fatal() {
        let patch = "\
diff --git a/x.txt b/x.txt
--- a/x.txt
+++ b/x.txt
@@ -1,2 +1,2 @@
 context
garbage line
";
        let result: Result<Vec<_>, _> = split_patch(patch).collect();
        assert!(matches!(result, Err(RepoError::PatchParse(_))));
    }

    #[test]
    fn test_trailing_signature_dropped() {
        let patch = "\
diff --git a/foo.txt b/foo.txt
--- a/foo.txt
+++ b/foo.txt
@@ -1 +1 @@
-a
+b
--
2.34.1

";
        let blocks = split_ok(patch);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].ends_with("+b\n"));
    }

    #[test]
    fn test_boundary_with_spaces_in_path() {
        assert_eq!(
            parse_boundary_line("diff --git a/dir/my file.txt b/dir/my file.txt"),
            Some("dir/my file.txt")
        );
        assert_eq!(parse_boundary_line("diff --git a/x b/y"), None);
        assert_eq!(parse_boundary_line("random line"), None);
    }

    #[test]
    fn test_parse_diff_block() {
        let blocks = split_ok(TWO_FILE_DIFF);
        let diff = parse_diff_block(&blocks[1]).unwrap();
        assert_eq!(diff.path, "bar.txt");
        assert!(diff.body.starts_with("new file mode 100644\n"));
    }

    #[test]
    fn test_file_kind_predicates() {
        assert!(is_new_file("new file mode 100644\nindex 000..111\n"));
        assert!(!is_new_file("index 000..111\n"));
        assert!(is_file_removal("deleted file mode 100644\n"));
        assert!(!is_file_removal("new file mode 100644\n"));
    }

    #[test]
    fn test_multiple_hunks_one_file() {
        let patch = "\
diff --git a/multi.txt b/multi.txt
--- a/multi.txt
+++ b/multi.txt
@@ -1,2 +1,2 @@
 first
-one
+uno
@@ -10,2 +10,2 @@
 tenth
-ten
+diez
";
        let blocks = split_ok(patch);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], patch);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert_eq!(split_patch("").count(), 0);
        assert!(split_hg_patch("").is_empty());
    }

    #[test]
    fn test_hg_boundary_accepts_renames() {
        assert!(is_hg_boundary_line("diff --git a/old/name.c b/new/name.c"));
        assert!(is_hg_boundary_line("diff --git a/x b/x"));
        assert!(!is_hg_boundary_line("diff -u something"));
        assert!(!is_hg_boundary_line(" diff --git a/x b/x"));

        assert_eq!(
            parse_hg_boundary_path("diff --git a/old/name.c b/new/name.c"),
            Some("old/name.c")
        );
        assert_eq!(
            parse_hg_boundary_path("diff --git a/my file.txt b/my file.txt"),
            Some("my file.txt")
        );
    }

    #[test]
    fn test_split_hg_patch_regions() {
        let patch = "\
diff --git a/proprietary/foo.cpp b/public/foo.cpp
rename from proprietary/foo.cpp
rename to public/foo.cpp
diff --git a/other.txt b/other.txt
--- a/other.txt
+++ b/other.txt
@@ -1 +1 @@
-a
+b
";
        let regions = split_hg_patch(patch);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].contains("rename from"));

        let diff = parse_hg_diff_block(&regions[0]).unwrap();
        assert_eq!(diff.path, "proprietary/foo.cpp");
        let diff = parse_hg_diff_block(&regions[1]).unwrap();
        assert_eq!(diff.path, "other.txt");
    }
}
