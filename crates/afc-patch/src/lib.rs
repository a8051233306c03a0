// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-patch
//!
//! Self-improvement patch admission.
//!
//! Candidate diffs pass through normalisation, a safety scan, a preflight
//! run in a scratch clone, and an emit/parse round-trip probe before the
//! all-or-nothing copy-over into the supervised workspace. Outcomes are
//! recorded in the archive and the audit ledger.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The admission pipeline.
pub mod admission;
/// Unified-diff parsing, emission, and application.
pub mod apply;
/// Deny patterns and allow-list checks.
pub mod guard;
/// Diff normalisation.
pub mod normalize;
/// Preflight command execution.
pub mod preflight;

pub use admission::{Admitted, AdmissionError, PatchAdmission, PatchRejected, Stage};
pub use apply::{FilePatch, Hunk, PatchApplyError, emit, parse, patched_contents};
pub use guard::{GuardViolation, PatchGuard};
pub use normalize::{changed_files, normalize, strip_prefix};
pub use preflight::{PreflightConfig, PreflightError, run_preflight};
