// SPDX-License-Identifier: MIT OR Apache-2.0
//! Safety scan: deny patterns plus an allow-list of file globs.

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexSet;
use std::fmt;
use std::sync::LazyLock;

use crate::normalize::changed_files;

/// Fixed deny patterns, matched case-insensitively against the whole diff:
/// destructive removal, outbound URLs, fetch helpers, and raw socket use.
const DENY_PATTERNS: &[&str] = &[
    r"rm\s+-rf",
    r"https?://",
    r"\bcurl\b",
    r"\bwget\b",
    r"requests\.get",
    r"urllib\.request",
    r"socket\.",
];

static DENY_SET: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(DENY_PATTERNS).expect("deny patterns compile"));

/// Why the safety scan refused a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    /// The diff is empty or whitespace.
    Empty,
    /// The diff references no files.
    NoFiles,
    /// Every touched file is a test file.
    TestsOnly,
    /// A deny pattern matched.
    DeniedPattern {
        /// The offending pattern.
        pattern: String,
    },
    /// A touched file falls outside the allow-list.
    OutsideAllowList {
        /// The offending path.
        file: String,
    },
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "diff is empty"),
            Self::NoFiles => write!(f, "diff references no files"),
            Self::TestsOnly => write!(f, "diff touches only test files"),
            Self::DeniedPattern { pattern } => write!(f, "deny pattern matched: {pattern}"),
            Self::OutsideAllowList { file } => {
                write!(f, "file outside allow-list: {file}")
            }
        }
    }
}

impl std::error::Error for GuardViolation {}

/// Returns `true` for paths the tests-only rule classifies as test files.
fn is_test_file(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    path.starts_with("tests/") || path.contains("/tests/") || basename.starts_with("test_")
}

/// Compiled allow-list plus the fixed deny patterns.
#[derive(Debug, Clone)]
pub struct PatchGuard {
    allow: Option<GlobSet>,
}

impl PatchGuard {
    /// Compile an allow-list of glob patterns. An empty list allows every
    /// path.
    ///
    /// # Errors
    ///
    /// Any pattern that fails to compile.
    pub fn new(allow: &[String]) -> anyhow::Result<Self> {
        if allow.is_empty() {
            return Ok(Self { allow: None });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in allow {
            // Legacy allow-lists write `**.py`; globset rejects `**`
            // adjacent to other characters, and its plain `*` already
            // crosses separators.
            let fixed = if pattern.starts_with("**") && !pattern.starts_with("**/") {
                pattern.replacen("**", "*", 1)
            } else {
                pattern.clone()
            };
            builder.add(Glob::new(&fixed)?);
        }
        Ok(Self {
            allow: Some(builder.build()?),
        })
    }

    /// Returns `true` when `path` is inside the allow-list.
    #[must_use]
    pub fn allows(&self, path: &str) -> bool {
        self.allow.as_ref().is_none_or(|set| set.is_match(path))
    }

    /// Scan a normalised diff.
    ///
    /// # Errors
    ///
    /// The first [`GuardViolation`] found, checked in the order: emptiness,
    /// deny patterns, file derivation, tests-only, allow-list.
    pub fn check(&self, diff: &str) -> Result<(), GuardViolation> {
        if diff.trim().is_empty() {
            return Err(GuardViolation::Empty);
        }

        let lowered = diff.to_lowercase();
        if let Some(idx) = DENY_SET.matches(&lowered).into_iter().next() {
            return Err(GuardViolation::DeniedPattern {
                pattern: DENY_PATTERNS[idx].to_string(),
            });
        }

        let files = changed_files(diff);
        if files.is_empty() {
            return Err(GuardViolation::NoFiles);
        }
        if files.iter().all(|f| is_test_file(f)) {
            return Err(GuardViolation::TestsOnly);
        }
        for file in &files {
            if !self.allows(file) {
                return Err(GuardViolation::OutsideAllowList { file: file.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(allow: &[&str]) -> PatchGuard {
        let patterns: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        PatchGuard::new(&patterns).unwrap()
    }

    fn diff_for(path: &str, added: &str) -> String {
        format!("--- a/{path}\n+++ b/{path}\n@@ -1,1 +1,1 @@\n-old\n+{added}\n")
    }

    #[test]
    fn clean_diff_passes() {
        guard(&["**.py"]).check(&diff_for("foo.py", "value = 2")).unwrap();
    }

    #[test]
    fn empty_diff_is_refused() {
        assert_eq!(guard(&[]).check("  \n"), Err(GuardViolation::Empty));
    }

    #[test]
    fn outbound_url_is_refused() {
        let err = guard(&["**.py"])
            .check(&diff_for("foo.py", "fetch('https://example.com')"))
            .unwrap_err();
        assert!(matches!(err, GuardViolation::DeniedPattern { .. }));
    }

    #[test]
    fn destructive_removal_is_refused() {
        let err = guard(&[])
            .check(&diff_for("run.sh", "rm -rf /"))
            .unwrap_err();
        assert_eq!(
            err,
            GuardViolation::DeniedPattern {
                pattern: r"rm\s+-rf".into()
            }
        );
    }

    #[test]
    fn network_helpers_are_refused() {
        for token in ["curl x", "wget x", "requests.get(u)", "urllib.request", "socket.socket()"] {
            let err = guard(&[]).check(&diff_for("foo.py", token)).unwrap_err();
            assert!(
                matches!(err, GuardViolation::DeniedPattern { .. }),
                "{token} should be denied"
            );
        }
    }

    #[test]
    fn deny_patterns_match_case_insensitively() {
        let err = guard(&[])
            .check(&diff_for("foo.py", "HTTPS://EXAMPLE.COM"))
            .unwrap_err();
        assert!(matches!(err, GuardViolation::DeniedPattern { .. }));
    }

    #[test]
    fn diff_without_file_headers_is_refused() {
        assert_eq!(
            guard(&[]).check("@@ -1,1 +1,1 @@\n-a\n+b\n"),
            Err(GuardViolation::NoFiles)
        );
    }

    #[test]
    fn tests_only_diffs_are_refused() {
        for path in ["tests/test_foo.py", "pkg/tests/helper.py", "test_bar.py"] {
            assert_eq!(
                guard(&[]).check(&diff_for(path, "x = 1")),
                Err(GuardViolation::TestsOnly),
                "{path} should count as a test file"
            );
        }
    }

    #[test]
    fn mixed_test_and_source_diffs_pass() {
        let diff = format!(
            "{}{}",
            diff_for("tests/test_foo.py", "x = 1"),
            diff_for("foo.py", "x = 1")
        );
        guard(&["**.py"]).check(&diff).unwrap();
    }

    #[test]
    fn allow_list_refuses_outside_paths() {
        let err = guard(&["src/**"])
            .check(&diff_for("secrets/key.pem", "x"))
            .unwrap_err();
        assert_eq!(
            err,
            GuardViolation::OutsideAllowList {
                file: "secrets/key.pem".into()
            }
        );
    }

    #[test]
    fn double_star_suffix_matches_nested_paths() {
        let g = guard(&["**.py"]);
        assert!(g.allows("foo.py"));
        assert!(g.allows("deep/nested/foo.py"));
        assert!(!g.allows("foo.rs"));
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        assert!(guard(&[]).allows("anything/at/all"));
    }
}
