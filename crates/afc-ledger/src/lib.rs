// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-ledger
//!
//! Append-only hash-chained audit ledger.
//!
//! The [`Ledger`] handle serialises all appends through one writer task, so
//! `seq` assignment is totally ordered regardless of how many tasks hold a
//! clone. Authoritative appends await the committed sequence number;
//! heartbeats use the best-effort lane and are dropped once the queue backs
//! up past its high-water mark.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Synchronous ledger file with fsync-on-commit.
pub mod file;
/// Framed record codec and Merkle-root computation.
pub mod frame;

pub use file::{LedgerFile, LedgerFileError, read_all};
pub use frame::{FrameError, HASH_LEN, LedgerEntry, chain_hash, merkle_root_hex};

use afc_core::{Envelope, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

/// Queue capacity of the writer task; doubles as the heartbeat high-water
/// mark.
const QUEUE_CAPACITY: usize = 512;

/// How many times an append is retried locally before the ledger is
/// declared unavailable.
const APPEND_RETRIES: u32 = 3;

/// Errors surfaced by the [`Ledger`] handle.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The body could not be serialised.
    #[error("ledger body rejected: {detail}")]
    BadBody {
        /// Serialiser detail.
        detail: String,
    },

    /// Appends are no longer possible; the process must shut down.
    #[error("ledger unavailable: {detail}")]
    Unavailable {
        /// Cause of the failure.
        detail: String,
    },
}

impl LedgerError {
    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadBody { .. } => ErrorCode::InvalidPayload,
            Self::Unavailable { .. } => ErrorCode::LedgerUnavailable,
        }
    }
}

enum Command {
    Append {
        body: serde_json::Value,
        ts: f64,
        reply: oneshot::Sender<Result<u64, LedgerError>>,
    },
    BestEffort {
        body: serde_json::Value,
        ts: f64,
    },
    Root {
        reply: oneshot::Sender<String>,
    },
    Len {
        reply: oneshot::Sender<u64>,
    },
}

/// Cloneable handle to the audit ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    tx: mpsc::Sender<Command>,
    dropped_beats: Arc<AtomicU64>,
}

impl Ledger {
    /// Open the ledger at `path` and spawn its writer task.
    ///
    /// The task exits when the last handle is dropped.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] when the file cannot be opened or an
    /// existing chain fails validation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let file = LedgerFile::open(path).map_err(|e| LedgerError::Unavailable {
            detail: e.to_string(),
        })?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(writer_task(file, rx));
        Ok(Self {
            tx,
            dropped_beats: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Append an arbitrary event body and await its committed `seq`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] once the writer has failed; treat as
    /// process-fatal.
    pub async fn append(&self, body: serde_json::Value, ts: f64) -> Result<u64, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Append { body, ts, reply })
            .await
            .map_err(|_| LedgerError::Unavailable {
                detail: "writer task gone".into(),
            })?;
        rx.await.map_err(|_| LedgerError::Unavailable {
            detail: "writer task dropped reply".into(),
        })?
    }

    /// Append an envelope and await its committed `seq`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BadBody`] when the envelope cannot be serialised;
    /// [`LedgerError::Unavailable`] once the writer has failed.
    pub async fn append_envelope(&self, env: &Envelope) -> Result<u64, LedgerError> {
        let body = serde_json::to_value(env).map_err(|e| LedgerError::BadBody {
            detail: e.to_string(),
        })?;
        self.append(body, env.ts).await
    }

    /// Best-effort heartbeat append.
    ///
    /// Returns `false` when the envelope was dropped because the writer
    /// queue is past its high-water mark. Drops are counted, not errors:
    /// heartbeats are advisory.
    pub fn append_best_effort(&self, env: &Envelope) -> bool {
        let Ok(body) = serde_json::to_value(env) else {
            self.dropped_beats.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match self.tx.try_send(Command::BestEffort { body, ts: env.ts }) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_beats.fetch_add(1, Ordering::Relaxed);
                warn!(target: "afc.ledger", sender = %env.sender, "heartbeat dropped, queue full");
                false
            }
        }
    }

    /// Number of heartbeats dropped by the best-effort lane.
    #[must_use]
    pub fn dropped_heartbeats(&self) -> u64 {
        self.dropped_beats.load(Ordering::Relaxed)
    }

    /// Compute the Merkle root over the current entries.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] once the writer task is gone.
    pub async fn merkle_root(&self) -> Result<String, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Root { reply })
            .await
            .map_err(|_| LedgerError::Unavailable {
                detail: "writer task gone".into(),
            })?;
        rx.await.map_err(|_| LedgerError::Unavailable {
            detail: "writer task dropped reply".into(),
        })
    }

    /// Number of committed entries.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] once the writer task is gone.
    pub async fn len(&self) -> Result<u64, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Len { reply })
            .await
            .map_err(|_| LedgerError::Unavailable {
                detail: "writer task gone".into(),
            })?;
        rx.await.map_err(|_| LedgerError::Unavailable {
            detail: "writer task dropped reply".into(),
        })
    }
}

/// Single writer: owns the file, assigns `seq`, commits in arrival order.
async fn writer_task(mut file: LedgerFile, mut rx: mpsc::Receiver<Command>) {
    let mut failed: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Append { body, ts, reply } => {
                let result = match &failed {
                    Some(detail) => Err(LedgerError::Unavailable {
                        detail: detail.clone(),
                    }),
                    None => match append_with_retry(&mut file, body, ts).await {
                        Ok(seq) => Ok(seq),
                        Err(detail) => {
                            error!(target: "afc.ledger", %detail, "append failed, ledger unavailable");
                            failed = Some(detail.clone());
                            Err(LedgerError::Unavailable { detail })
                        }
                    },
                };
                let _ = reply.send(result);
            }
            Command::BestEffort { body, ts } => {
                if failed.is_none()
                    && let Err(detail) = append_with_retry(&mut file, body, ts).await
                {
                    error!(target: "afc.ledger", %detail, "append failed, ledger unavailable");
                    failed = Some(detail);
                }
            }
            Command::Root { reply } => {
                let _ = reply.send(file.merkle_root());
            }
            Command::Len { reply } => {
                let _ = reply.send(file.len());
            }
        }
    }
}

/// Retry a failing append a few times before giving up.
async fn append_with_retry(
    file: &mut LedgerFile,
    body: serde_json::Value,
    ts: f64,
) -> Result<u64, String> {
    let mut last = String::new();
    for attempt in 0..APPEND_RETRIES {
        match file.append(body.clone(), ts) {
            Ok(seq) => return Ok(seq),
            Err(e @ LedgerFileError::Frame(_)) => return Err(e.to_string()),
            Err(e) => {
                last = e.to_string();
                warn!(target: "afc.ledger", attempt, detail = %last, "append attempt failed");
                tokio::time::sleep(std::time::Duration::from_millis(10 << attempt)).await;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use afc_core::heartbeat;

    #[tokio::test]
    async fn appends_are_totally_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.bin")).unwrap();
        let mut seqs = Vec::new();
        for i in 0..20 {
            seqs.push(
                ledger
                    .append(serde_json::json!({"i": i}), i as f64)
                    .await
                    .unwrap(),
            );
        }
        let expected: Vec<u64> = (1..=20).collect();
        assert_eq!(seqs, expected);
        assert_eq!(ledger.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn concurrent_appends_produce_no_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.bin")).unwrap();
        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(serde_json::json!({"task": i}), i as f64)
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn envelope_appends_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let ledger = Ledger::open(&path).unwrap();
        let env = heartbeat("planner", 9.0);
        ledger.append_envelope(&env).await.unwrap();
        // A second handle sees the same state.
        assert_eq!(ledger.clone().len().await.unwrap(), 1);

        drop(ledger);
        let entries = read_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body["sender"], "planner");
    }

    #[tokio::test]
    async fn best_effort_reports_drops_when_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.bin")).unwrap();
        let env = heartbeat("a", 1.0);
        // Far past the queue capacity; some sends must be dropped because
        // the writer cannot drain this fast synchronously.
        let mut dropped = 0u64;
        for _ in 0..(QUEUE_CAPACITY * 4) {
            if !ledger.append_best_effort(&env) {
                dropped += 1;
            }
        }
        assert_eq!(ledger.dropped_heartbeats(), dropped);
    }

    #[tokio::test]
    async fn root_matches_file_computation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let ledger = Ledger::open(&path).unwrap();
        for i in 0..5 {
            ledger
                .append(serde_json::json!({"i": i}), i as f64)
                .await
                .unwrap();
        }
        let root = ledger.merkle_root().await.unwrap();
        drop(ledger);
        let leaves: Vec<_> = read_all(&path)
            .unwrap()
            .iter()
            .map(|e| e.hash_self)
            .collect();
        assert_eq!(root, merkle_root_hex(&leaves));
    }

    #[tokio::test]
    async fn open_rejects_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let err = Ledger::open(dir.path().join("no-such").join("l.bin")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LedgerUnavailable);
    }
}
