// SPDX-License-Identifier: MIT OR Apache-2.0
//! The universal message type exchanged over the bus.
//!
//! An [`Envelope`] is created by a producer, immutable thereafter, and
//! consumed by zero or more subscribers. Payloads are closed JSON values
//! held in a [`Payload`] map that serialises deterministically.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ErrorCode;

/// Default cap on the serialised payload size (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Errors from envelope construction and wire conversion.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The payload could not be serialised to JSON.
    #[error("payload is not JSON-serialisable: {detail}")]
    NotSerialisable {
        /// Serialiser error detail.
        detail: String,
    },

    /// The serialised payload exceeds the configured size cap.
    #[error("payload size {size} exceeds limit {limit}")]
    TooLarge {
        /// Serialised size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Wire text could not be parsed back into an envelope.
    #[error("malformed wire envelope: {detail}")]
    MalformedWire {
        /// Parser error detail.
        detail: String,
    },
}

impl EnvelopeError {
    /// Stable code for this error. All envelope failures are payload-local.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidPayload
    }
}

/// Deterministically ordered JSON payload map.
///
/// Keys are sorted by the underlying `BTreeMap`, so two payloads with the
/// same contents always serialise to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, serde_json::Value>);

impl Payload {
    /// Create an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key/value pair, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Returns `true` when the payload holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of top-level entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Payload {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, serde_json::Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The universal routed message.
///
/// Construction coerces missing fields: an absent sender or recipient
/// becomes the empty string and an absent timestamp becomes `0.0`, matching
/// the wire-format defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// Originating agent id.
    #[serde(default)]
    pub sender: String,

    /// Topic or agent id this envelope is addressed to.
    #[serde(default)]
    pub recipient: String,

    /// Structured JSON payload.
    #[serde(default)]
    pub payload: Payload,

    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub ts: f64,
}

impl Envelope {
    /// Create an envelope with an empty payload and `ts = 0.0`.
    #[must_use]
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            payload: Payload::new(),
            ts: 0.0,
        }
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Replace the timestamp.
    #[must_use]
    pub fn with_ts(mut self, ts: f64) -> Self {
        self.ts = ts;
        self
    }

    /// Serialise to the JSON wire form
    /// `{"sender":…,"recipient":…,"payload":…,"ts":…}`.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::NotSerialisable`] when the payload holds a value the
    /// serialiser refuses (e.g. a non-finite float).
    pub fn to_wire(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::NotSerialisable {
            detail: e.to_string(),
        })
    }

    /// Parse the JSON wire form produced by [`to_wire`](Self::to_wire).
    ///
    /// Missing fields take their coercion defaults.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::MalformedWire`] when the text is not a JSON object
    /// of the expected shape.
    pub fn from_wire(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(|e| EnvelopeError::MalformedWire {
            detail: e.to_string(),
        })
    }

    /// Serialised size of the payload alone, in bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::NotSerialisable`] when the payload cannot be
    /// serialised.
    pub fn payload_size(&self) -> Result<usize, EnvelopeError> {
        serde_json::to_vec(&self.payload)
            .map(|v| v.len())
            .map_err(|e| EnvelopeError::NotSerialisable {
                detail: e.to_string(),
            })
    }

    /// Validate the payload against a size cap.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::TooLarge`] when the serialised payload exceeds
    /// `limit`; [`EnvelopeError::NotSerialisable`] when it cannot be
    /// serialised at all.
    pub fn check_payload(&self, limit: usize) -> Result<(), EnvelopeError> {
        let size = self.payload_size()?;
        if size > limit {
            return Err(EnvelopeError::TooLarge { size, limit });
        }
        Ok(())
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Issues per-sender monotonic timestamps.
///
/// The stamp is the wall clock, clamped so that a sender never observes a
/// timestamp earlier than its previous one within this process.
#[derive(Debug, Default)]
pub struct MonotonicStamper {
    last: Mutex<BTreeMap<String, f64>>,
}

impl MonotonicStamper {
    /// Create a stamper with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next timestamp for `sender`.
    pub fn stamp(&self, sender: &str) -> f64 {
        let mut last = self.last.lock().expect("stamper lock poisoned");
        let now = now_ts();
        let entry = last.entry(sender.to_string()).or_insert(0.0);
        let ts = if now > *entry { now } else { *entry };
        *entry = ts;
        ts
    }
}
