// SPDX-License-Identifier: MIT OR Apache-2.0
//! Framed binary record format for the audit ledger.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! len(4) | seq(8) | ts(8, f64 bits) | body_len(4) | body(JSON) | hash_prev(32) | hash_self(32)
//! ```
//!
//! `len` counts every byte after itself. `hash_self` is
//! `SHA-256(seq ∥ ts ∥ body ∥ hash_prev)`; readers recompute it and reject
//! the frame on mismatch.

use sha2::{Digest, Sha256};

pub use afc_core::hash::{HASH_LEN, hex, merkle_root_hex};

/// Fixed overhead of a frame after the `len` prefix.
const FIXED_LEN: usize = 8 + 8 + 4 + HASH_LEN + HASH_LEN;

/// Errors from frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body is not serialisable JSON.
    #[error("ledger body is not JSON-serialisable: {detail}")]
    BodyNotJson {
        /// Serialiser detail.
        detail: String,
    },

    /// The buffer does not contain a complete, well-formed frame.
    #[error("malformed ledger frame: {detail}")]
    Malformed {
        /// Parser detail.
        detail: String,
    },

    /// Recomputing `hash_self` did not reproduce the stored value.
    #[error("hash mismatch at seq {seq}")]
    HashMismatch {
        /// Sequence number of the offending entry.
        seq: u64,
    },

    /// The chain is out of order or has a gap.
    #[error("broken chain at seq {seq}: {detail}")]
    BrokenChain {
        /// Sequence number of the offending entry.
        seq: u64,
        /// What was wrong.
        detail: String,
    },
}

/// One committed ledger record.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Strictly increasing sequence number, starting at 1.
    pub seq: u64,
    /// Seconds since the Unix epoch at append time.
    pub ts: f64,
    /// Envelope or event body.
    pub body: serde_json::Value,
    /// `hash_self` of the previous entry (all zeroes for the first).
    pub hash_prev: [u8; HASH_LEN],
    /// Chain hash of this entry.
    pub hash_self: [u8; HASH_LEN],
}

/// Compute the chain hash `SHA-256(seq ∥ ts ∥ body ∥ hash_prev)`.
#[must_use]
pub fn chain_hash(seq: u64, ts: f64, body: &[u8], hash_prev: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(ts.to_bits().to_be_bytes());
    hasher.update(body);
    hasher.update(hash_prev);
    hasher.finalize().into()
}

impl LedgerEntry {
    /// Build a new entry chained onto `hash_prev`.
    ///
    /// # Errors
    ///
    /// [`FrameError::BodyNotJson`] when the body cannot be serialised.
    pub fn create(
        seq: u64,
        ts: f64,
        body: serde_json::Value,
        hash_prev: [u8; HASH_LEN],
    ) -> Result<Self, FrameError> {
        let body_bytes = serde_json::to_vec(&body).map_err(|e| FrameError::BodyNotJson {
            detail: e.to_string(),
        })?;
        let hash_self = chain_hash(seq, ts, &body_bytes, &hash_prev);
        Ok(Self {
            seq,
            ts,
            body,
            hash_prev,
            hash_self,
        })
    }

    /// Encode the entry into its framed wire form.
    ///
    /// # Errors
    ///
    /// [`FrameError::BodyNotJson`] when the body cannot be serialised.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body_bytes = serde_json::to_vec(&self.body).map_err(|e| FrameError::BodyNotJson {
            detail: e.to_string(),
        })?;
        let len = FIXED_LEN + body_bytes.len();
        let mut out = Vec::with_capacity(4 + len);
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ts.to_bits().to_be_bytes());
        out.extend_from_slice(&(body_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&body_bytes);
        out.extend_from_slice(&self.hash_prev);
        out.extend_from_slice(&self.hash_self);
        Ok(out)
    }

    /// Decode one frame from the front of `buf`, validating the chain hash.
    ///
    /// Returns the entry and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// [`FrameError::Malformed`] on truncation or bad structure;
    /// [`FrameError::HashMismatch`] when the recomputed `hash_self`
    /// disagrees with the stored one.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        if buf.len() < 4 {
            return Err(FrameError::Malformed {
                detail: "truncated length prefix".into(),
            });
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().expect("sliced 4 bytes")) as usize;
        if len < FIXED_LEN {
            return Err(FrameError::Malformed {
                detail: format!("frame length {len} below fixed overhead"),
            });
        }
        let frame = buf
            .get(4..4 + len)
            .ok_or_else(|| FrameError::Malformed {
                detail: "truncated frame".into(),
            })?;
        let seq = u64::from_be_bytes(frame[0..8].try_into().expect("sliced 8 bytes"));
        let ts = f64::from_bits(u64::from_be_bytes(
            frame[8..16].try_into().expect("sliced 8 bytes"),
        ));
        let body_len =
            u32::from_be_bytes(frame[16..20].try_into().expect("sliced 4 bytes")) as usize;
        if 20 + body_len + 2 * HASH_LEN != len {
            return Err(FrameError::Malformed {
                detail: format!("body length {body_len} inconsistent with frame length {len}"),
            });
        }
        let body_bytes = &frame[20..20 + body_len];
        let body: serde_json::Value =
            serde_json::from_slice(body_bytes).map_err(|e| FrameError::Malformed {
                detail: format!("body is not JSON: {e}"),
            })?;
        let mut hash_prev = [0u8; HASH_LEN];
        hash_prev.copy_from_slice(&frame[20 + body_len..20 + body_len + HASH_LEN]);
        let mut hash_self = [0u8; HASH_LEN];
        hash_self.copy_from_slice(&frame[20 + body_len + HASH_LEN..]);

        if chain_hash(seq, ts, body_bytes, &hash_prev) != hash_self {
            return Err(FrameError::HashMismatch { seq });
        }

        Ok((
            Self {
                seq,
                ts,
                body,
                hash_prev,
                hash_self,
            },
            4 + len,
        ))
    }
}
