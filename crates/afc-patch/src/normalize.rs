// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic, idempotent unified-diff normalisation.
//!
//! Normalisation folds CRLF line endings, guarantees a terminating newline,
//! and fills in hunk ranges for headers written as a bare `@@`. The start
//! line is inferred by locating the hunk's first context-or-removal line in
//! the target file, falling back to line 1 when the file or line cannot be
//! found.

use std::path::Path;

/// Strip the conventional `a/` / `b/` prefixes from a diff path.
#[must_use]
pub fn strip_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Paths touched by a diff, derived from its `---`/`+++` headers.
///
/// `/dev/null` markers are skipped; the result is sorted and deduplicated.
#[must_use]
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = diff
        .lines()
        .filter(|l| l.starts_with("--- ") || l.starts_with("+++ "))
        .filter_map(|l| l[4..].split('\t').next())
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "/dev/null")
        .map(|p| strip_prefix(p).to_string())
        .collect();
    files.sort();
    files.dedup();
    files
}

/// Returns `true` when a `@@` header already carries explicit ranges.
fn has_ranges(line: &str) -> bool {
    line.strip_prefix("@@ -")
        .and_then(|rest| rest.bytes().next())
        .is_some_and(|b| b.is_ascii_digit())
}

/// Returns `true` for lines that belong to a hunk body.
fn is_hunk_body(line: &str) -> bool {
    !line.starts_with("--- ")
        && !line.starts_with("+++ ")
        && !line.starts_with("@@")
}

/// Normalise a unified diff against `repo_root`.
///
/// The result always ends with a newline, uses LF endings, and has explicit
/// `@@ -start,old +start,new @@` ranges on every hunk. Running the function
/// twice yields the same bytes.
#[must_use]
pub fn normalize(diff: &str, repo_root: &Path) -> String {
    let diff = diff.replace("\r\n", "\n");
    let lines: Vec<&str> = diff.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut current_file: Option<String> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
            if let Some(path) = rest.split('\t').next() {
                let path = strip_prefix(path.trim());
                if path != "/dev/null" {
                    current_file = Some(path.to_string());
                }
            }
            out.push(line.to_string());
            i += 1;
            continue;
        }
        if line.starts_with("@@") && !has_ranges(line) {
            let mut hunk: Vec<&str> = Vec::new();
            let mut j = i + 1;
            while j < lines.len() && is_hunk_body(lines[j]) && !lines[j].is_empty() {
                hunk.push(lines[j]);
                j += 1;
            }
            let old_count = hunk
                .iter()
                .filter(|l| l.starts_with(' ') || l.starts_with('-'))
                .count();
            let new_count = hunk
                .iter()
                .filter(|l| l.starts_with(' ') || l.starts_with('+'))
                .count();
            let start = infer_start(&hunk, current_file.as_deref(), repo_root);
            out.push(format!("@@ -{start},{old_count} +{start},{new_count} @@"));
            out.extend(hunk.iter().map(|l| (*l).to_string()));
            i = j;
            continue;
        }
        out.push(line.to_string());
        i += 1;
    }

    // Collapse the artefact of splitting a newline-terminated string.
    while out.last().is_some_and(String::is_empty) {
        out.pop();
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Locate the hunk's first context-or-removal line in the target file.
fn infer_start(hunk: &[&str], file: Option<&str>, repo_root: &Path) -> usize {
    let Some(candidate) = hunk
        .iter()
        .find(|l| l.starts_with(' ') || l.starts_with('-'))
        .map(|l| &l[1..])
    else {
        return 1;
    };
    let Some(file) = file else { return 1 };
    let Ok(content) = std::fs::read_to_string(repo_root.join(file)) else {
        return 1;
    };
    content
        .lines()
        .position(|l| l == candidate)
        .map_or(1, |idx| idx + 1)
}
