// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable machine-readable error codes shared across the orchestrator.
//!
//! Codes serialise to `SCREAMING_SNAKE_CASE` strings that are guaranteed not
//! to change across patch releases. Component crates define their own
//! `thiserror` types and map them onto these codes at the public surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad family an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Envelope and payload errors, local to the publisher.
    Messaging,
    /// Failures inside an agent's cycle or envelope handler.
    Agent,
    /// Append-only ledger errors.
    Ledger,
    /// Plugin loading and verification errors.
    Plugin,
    /// Patch admission pipeline rejections.
    Patch,
    /// Audit disagreements.
    Audit,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Messaging => "messaging",
            Self::Agent => "agent",
            Self::Ledger => "ledger",
            Self::Plugin => "plugin",
            Self::Patch => "patch",
            Self::Audit => "audit",
        };
        f.write_str(s)
    }
}

/// Stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Publish payload is not JSON-serialisable or exceeds the size cap.
    InvalidPayload,
    /// A subscriber's handler raised; counted against the agent.
    HandlerFailure,
    /// An agent's `run_cycle` raised; counted toward restart.
    CycleFailure,
    /// Ledger append failed after local retries; process-fatal.
    LedgerUnavailable,
    /// Plugin signature missing/invalid or pinned digest mismatch.
    PluginRejected,
    /// Patch admission pipeline rejected the candidate diff.
    PatchRejected,
    /// Preflight subprocess exceeded its wall-clock budget.
    PreflightTimeout,
    /// Recomputed Merkle root disagreed with the expected root.
    MerkleMismatch,
}

impl ErrorCode {
    /// The broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPayload => ErrorCategory::Messaging,
            Self::HandlerFailure | Self::CycleFailure => ErrorCategory::Agent,
            Self::LedgerUnavailable => ErrorCategory::Ledger,
            Self::PluginRejected => ErrorCategory::Plugin,
            Self::PatchRejected | Self::PreflightTimeout => ErrorCategory::Patch,
            Self::MerkleMismatch => ErrorCategory::Audit,
        }
    }

    /// Stable `&'static str` representation (e.g. `"INVALID_PAYLOAD"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::HandlerFailure => "HANDLER_FAILURE",
            Self::CycleFailure => "CYCLE_FAILURE",
            Self::LedgerUnavailable => "LEDGER_UNAVAILABLE",
            Self::PluginRejected => "PLUGIN_REJECTED",
            Self::PatchRejected => "PATCH_REJECTED",
            Self::PreflightTimeout => "PREFLIGHT_TIMEOUT",
            Self::MerkleMismatch => "MERKLE_MISMATCH",
        }
    }

    /// Returns `true` for the single process-fatal code.
    ///
    /// Everything else is converted to counters and alerts and kept local.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerUnavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::InvalidPayload,
        ErrorCode::HandlerFailure,
        ErrorCode::CycleFailure,
        ErrorCode::LedgerUnavailable,
        ErrorCode::PluginRejected,
        ErrorCode::PatchRejected,
        ErrorCode::PreflightTimeout,
        ErrorCode::MerkleMismatch,
    ];

    #[test]
    fn codes_have_unique_strings() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate: {code}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn only_ledger_unavailable_is_fatal() {
        for code in ALL_CODES {
            assert_eq!(
                code.is_fatal(),
                matches!(code, ErrorCode::LedgerUnavailable),
                "unexpected fatality for {code}"
            );
        }
    }

    #[test]
    fn serde_matches_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!(r#""{}""#, code.as_str()));
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, code);
        }
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(
            ErrorCode::InvalidPayload.category(),
            ErrorCategory::Messaging
        );
        assert_eq!(ErrorCode::CycleFailure.category(), ErrorCategory::Agent);
        assert_eq!(
            ErrorCode::PreflightTimeout.category(),
            ErrorCategory::Patch
        );
        assert_eq!(ErrorCode::MerkleMismatch.category(), ErrorCategory::Audit);
    }

    #[test]
    fn category_display() {
        assert_eq!(ErrorCategory::Messaging.to_string(), "messaging");
        assert_eq!(ErrorCategory::Audit.to_string(), "audit");
    }
}
