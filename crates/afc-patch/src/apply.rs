// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified-diff parsing, emission, and context-matched application.
//!
//! The parser and [`emit`] are exact inverses over normalised diffs, which
//! is what the admission pipeline's round-trip probe relies on.

use std::collections::BTreeMap;
use std::path::Path;

use crate::normalize::strip_prefix;

/// Errors from parsing or applying a patch.
#[derive(Debug, thiserror::Error)]
pub enum PatchApplyError {
    /// The diff has no file hunks.
    #[error("no file hunks found in patch")]
    NoHunks,

    /// A structural rule was violated.
    #[error("malformed patch: {detail}")]
    Malformed {
        /// Parser detail.
        detail: String,
    },

    /// A target file does not exist.
    #[error("target file not found: {path}")]
    MissingFile {
        /// Relative path of the missing file.
        path: String,
    },

    /// A hunk's context did not match the target file.
    #[error("hunk does not match target file: {path}")]
    ContextMismatch {
        /// Relative path of the file being patched.
        path: String,
    },

    /// Underlying filesystem failure.
    #[error("patch I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

/// One hunk with explicit ranges and its body lines (prefixes retained).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line in the old file.
    pub old_start: usize,
    /// Line count in the old file.
    pub old_count: usize,
    /// 1-based start line in the new file.
    pub new_start: usize,
    /// Line count in the new file.
    pub new_count: usize,
    /// Optional section text after the closing `@@`.
    pub section: String,
    /// Body lines, each prefixed with ` `, `-`, or `+`.
    pub lines: Vec<String>,
}

/// All hunks for one file, plus the verbatim header lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Lines preceding the `---` header (e.g. `diff --git …`).
    pub preamble: Vec<String>,
    /// The verbatim `---` header line.
    pub old_header: String,
    /// The verbatim `+++` header line.
    pub new_header: String,
    /// Target path with `a/`/`b/` prefixes stripped.
    pub path: String,
    /// Hunks in file order.
    pub hunks: Vec<Hunk>,
}

/// Parse a `@@ -a,b +c,d @@…` header.
fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize, String)> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, section) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    let parse_pair = |s: &str| -> Option<(usize, usize)> {
        match s.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)),
        }
    };
    let (old_start, old_count) = parse_pair(old)?;
    let (new_start, new_count) = parse_pair(new)?;
    Some((old_start, old_count, new_start, new_count, section.to_string()))
}

/// Parse a normalised unified diff into per-file patches.
///
/// # Errors
///
/// [`PatchApplyError::NoHunks`] for a diff without any file sections;
/// [`PatchApplyError::Malformed`] for structural violations.
pub fn parse(diff: &str) -> Result<Vec<FilePatch>, PatchApplyError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut preamble: Vec<String> = Vec::new();
    let mut pending_old: Option<String> = None;

    for line in diff.lines() {
        if line.starts_with("--- ") {
            if pending_old.is_some() {
                return Err(PatchApplyError::Malformed {
                    detail: "consecutive --- headers".into(),
                });
            }
            pending_old = Some(line.to_string());
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let old_header = pending_old.take().ok_or_else(|| PatchApplyError::Malformed {
                detail: "+++ header without ---".into(),
            })?;
            let path = strip_prefix(rest.split('\t').next().unwrap_or(rest).trim()).to_string();
            patches.push(FilePatch {
                preamble: std::mem::take(&mut preamble),
                old_header,
                new_header: line.to_string(),
                path,
                hunks: Vec::new(),
            });
        } else if line.starts_with("@@") {
            let (old_start, old_count, new_start, new_count, section) = parse_hunk_header(line)
                .ok_or_else(|| PatchApplyError::Malformed {
                    detail: format!("bad hunk header: {line}"),
                })?;
            let file = patches.last_mut().ok_or_else(|| PatchApplyError::Malformed {
                detail: "hunk before file headers".into(),
            })?;
            file.hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                section,
                lines: Vec::new(),
            });
        } else if let Some(file) = patches.last_mut()
            && let Some(hunk) = file.hunks.last_mut()
            && (line.starts_with(' ') || line.starts_with('-') || line.starts_with('+'))
        {
            hunk.lines.push(line.to_string());
        } else if line.starts_with('\\') {
            // "\ No newline at end of file" markers carry no content.
            continue;
        } else {
            preamble.push(line.to_string());
        }
    }

    if patches.is_empty() {
        return Err(PatchApplyError::NoHunks);
    }
    Ok(patches)
}

/// Emit patches back to unified-diff text, the inverse of [`parse`] over
/// normalised input.
#[must_use]
pub fn emit(patches: &[FilePatch]) -> String {
    let mut out = String::new();
    for file in patches {
        for line in &file.preamble {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&file.old_header);
        out.push('\n');
        out.push_str(&file.new_header);
        out.push('\n');
        for hunk in &file.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@{}\n",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count, hunk.section
            ));
            for line in &hunk.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// Compute the patched contents of every touched file without writing.
///
/// Hunks are matched by context: the ` `/`-` lines must appear verbatim in
/// the target, searched first at the declared start line and then across
/// the whole file.
///
/// # Errors
///
/// Missing targets, context mismatches, and I/O failures.
pub fn patched_contents(
    root: &Path,
    patches: &[FilePatch],
) -> Result<BTreeMap<String, String>, PatchApplyError> {
    let mut results = BTreeMap::new();
    for file in patches {
        let target = root.join(&file.path);
        if !target.is_file() {
            return Err(PatchApplyError::MissingFile {
                path: file.path.clone(),
            });
        }
        let original = std::fs::read_to_string(&target).map_err(|source| PatchApplyError::Io {
            path: file.path.clone(),
            source,
        })?;
        let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
        for hunk in &file.hunks {
            lines = apply_hunk(&lines, hunk, &file.path)?;
        }
        let mut updated = lines.join("\n");
        if original.ends_with('\n') {
            updated.push('\n');
        }
        results.insert(file.path.clone(), updated);
    }
    Ok(results)
}

fn apply_hunk(lines: &[String], hunk: &Hunk, path: &str) -> Result<Vec<String>, PatchApplyError> {
    let needle: Vec<&str> = hunk
        .lines
        .iter()
        .filter(|l| l.starts_with(' ') || l.starts_with('-'))
        .map(|l| &l[1..])
        .collect();
    let replacement: Vec<&str> = hunk
        .lines
        .iter()
        .filter(|l| l.starts_with(' ') || l.starts_with('+'))
        .map(|l| &l[1..])
        .collect();
    if needle.is_empty() {
        return Err(PatchApplyError::Malformed {
            detail: "hunk has no context or removals".into(),
        });
    }

    let matches_at = |idx: usize| -> bool {
        idx + needle.len() <= lines.len()
            && needle
                .iter()
                .zip(&lines[idx..idx + needle.len()])
                .all(|(n, l)| *n == l.as_str())
    };

    // Declared position first, then a full scan.
    let declared = hunk.old_start.saturating_sub(1);
    let position = if matches_at(declared) {
        Some(declared)
    } else {
        (0..=lines.len().saturating_sub(needle.len())).find(|&idx| matches_at(idx))
    };
    let Some(idx) = position else {
        return Err(PatchApplyError::ContextMismatch {
            path: path.to_string(),
        });
    };

    let mut out = Vec::with_capacity(lines.len() + replacement.len() - needle.len());
    out.extend_from_slice(&lines[..idx]);
    out.extend(replacement.iter().map(|s| (*s).to_string()));
    out.extend_from_slice(&lines[idx + needle.len()..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str =
        "--- a/foo.py\n+++ b/foo.py\n@@ -1,3 +1,3 @@\n alpha\n-beta\n+BETA\n gamma\n";

    #[test]
    fn parse_extracts_structure() {
        let patches = parse(DIFF).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, "foo.py");
        assert_eq!(patches[0].hunks.len(), 1);
        let hunk = &patches[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 3));
        assert_eq!(hunk.lines.len(), 4);
    }

    #[test]
    fn emit_is_the_inverse_of_parse() {
        assert_eq!(emit(&parse(DIFF).unwrap()), DIFF);
    }

    #[test]
    fn roundtrip_preserves_preamble_and_sections() {
        let diff = "diff --git a/foo.py b/foo.py\n--- a/foo.py\n+++ b/foo.py\n@@ -1,1 +1,1 @@ def foo():\n-a\n+b\n";
        assert_eq!(emit(&parse(diff).unwrap()), diff);
    }

    #[test]
    fn apply_replaces_matched_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.py"), "alpha\nbeta\ngamma\n").unwrap();
        let contents = patched_contents(dir.path(), &parse(DIFF).unwrap()).unwrap();
        assert_eq!(contents["foo.py"], "alpha\nBETA\ngamma\n");
    }

    #[test]
    fn apply_falls_back_to_scanning_for_context() {
        let dir = tempfile::tempdir().unwrap();
        // The declared start (line 1) is wrong; the hunk sits at line 3.
        std::fs::write(dir.path().join("foo.py"), "pre\npre2\nalpha\nbeta\ngamma\n").unwrap();
        let contents = patched_contents(dir.path(), &parse(DIFF).unwrap()).unwrap();
        assert_eq!(contents["foo.py"], "pre\npre2\nalpha\nBETA\ngamma\n");
    }

    #[test]
    fn missing_target_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = patched_contents(dir.path(), &parse(DIFF).unwrap()).unwrap_err();
        assert!(matches!(err, PatchApplyError::MissingFile { .. }));
    }

    #[test]
    fn context_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.py"), "entirely\ndifferent\n").unwrap();
        let err = patched_contents(dir.path(), &parse(DIFF).unwrap()).unwrap_err();
        assert!(matches!(err, PatchApplyError::ContextMismatch { .. }));
    }

    #[test]
    fn multi_hunk_multi_file_diffs_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1\n2\n3\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x\ny\n").unwrap();
        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-1\n+one\n@@ -3,1 +3,1 @@\n-3\n+three\n--- a/b.txt\n+++ b/b.txt\n@@ -2,1 +2,1 @@\n-y\n+why\n";
        let contents = patched_contents(dir.path(), &parse(diff).unwrap()).unwrap();
        assert_eq!(contents["a.txt"], "one\n2\nthree\n");
        assert_eq!(contents["b.txt"], "x\nwhy\n");
    }

    #[test]
    fn empty_diff_has_no_hunks() {
        assert!(matches!(parse(""), Err(PatchApplyError::NoHunks)));
    }
}
