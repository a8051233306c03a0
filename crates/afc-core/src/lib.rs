// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-core
//!
//! The stable contract for the Alpha-Factory orchestration core.
//!
//! Everything agents exchange is an [`Envelope`]; everything the supervisor
//! announces about an agent's life is a [`LifecycleEvent`]; everything that
//! can go wrong maps to an [`ErrorCode`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Envelope, payload guard, and wire codec.
pub mod envelope;
/// Stable machine-readable error codes.
pub mod error;
/// Lifecycle events published on the `system` topic.
pub mod event;
/// SHA-256 and Merkle-root helpers.
pub mod hash;

pub use envelope::{
    DEFAULT_MAX_PAYLOAD_BYTES, Envelope, EnvelopeError, MonotonicStamper, Payload, now_ts,
};
pub use error::{ErrorCategory, ErrorCode};
pub use event::{LifecycleEvent, LifecycleKind, TOPIC_ORCH, TOPIC_SYSTEM, heartbeat, is_heartbeat};

/// Well-known sender id used by the orchestrator itself.
pub const ORCHESTRATOR: &str = "orch";
