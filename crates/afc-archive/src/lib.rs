// SPDX-License-Identifier: MIT OR Apache-2.0
//! afc-archive
//!
//! Durable lineage and score store.
//!
//! Entries form a forest: admitted patches and experiment results are added
//! with an optional parent, and promotion decisions read lineage root-first.
//! Persistence is one JSON line per entry, synced on every write; reads run
//! concurrently against the in-memory indices.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use afc_core::hash::{merkle_root_hex, sha256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Errors from archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Underlying filesystem failure.
    #[error("archive I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted line could not be parsed.
    #[error("malformed archive line {line}: {detail}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parser detail.
        detail: String,
    },

    /// The referenced parent does not exist.
    #[error("unknown parent id {parent}")]
    UnknownParent {
        /// Parent id that was referenced.
        parent: u64,
    },

    /// The referenced entry does not exist.
    #[error("unknown entry id {id}")]
    UnknownEntry {
        /// Entry id that was looked up.
        id: u64,
    },
}

/// One lineage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Unique, monotonically assigned id.
    pub id: u64,
    /// Parent entry, `None` for a lineage root.
    pub parent_id: Option<u64>,
    /// Arbitrary JSON payload (genome, patch reference, …).
    pub payload: serde_json::Value,
    /// Scalar score used by promotion decisions.
    pub score: f64,
    /// Seconds since the Unix epoch at insertion.
    pub created_ts: f64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u64, ArchiveEntry>,
    children: BTreeMap<u64, Vec<u64>>,
    by_created: Vec<(f64, u64)>,
    next_id: u64,
}

/// Durable key/value store of [`ArchiveEntry`]s.
///
/// Writes are serialised through the file lock; reads share the state lock.
#[derive(Debug)]
pub struct Archive {
    state: RwLock<State>,
    file: Mutex<File>,
    path: PathBuf,
}

impl Archive {
    /// Open or create the archive at `path`, loading any existing entries.
    ///
    /// # Errors
    ///
    /// I/O failures and malformed persisted lines.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let mut state = State::default();
        if path.exists() {
            let file = File::open(&path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            for (i, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|source| ArchiveError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: ArchiveEntry =
                    serde_json::from_str(&line).map_err(|e| ArchiveError::Malformed {
                        line: i + 1,
                        detail: e.to_string(),
                    })?;
                state.next_id = state.next_id.max(entry.id + 1);
                if let Some(parent) = entry.parent_id {
                    state.children.entry(parent).or_default().push(entry.id);
                }
                state.by_created.push((entry.created_ts, entry.id));
                state.entries.insert(entry.id, entry);
            }
        }
        if state.next_id == 0 {
            state.next_id = 1;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            state: RwLock::new(state),
            file: Mutex::new(file),
            path,
        })
    }

    /// Insert an entry and return its id.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::UnknownParent`] when `parent_id` names a missing
    /// entry; I/O failures on persistence.
    pub fn add(
        &self,
        parent_id: Option<u64>,
        payload: serde_json::Value,
        score: f64,
    ) -> Result<u64, ArchiveError> {
        let entry = {
            let mut state = self.state.write().expect("archive state poisoned");
            if let Some(parent) = parent_id
                && !state.entries.contains_key(&parent)
            {
                return Err(ArchiveError::UnknownParent { parent });
            }
            let id = state.next_id;
            let entry = ArchiveEntry {
                id,
                parent_id,
                payload,
                score,
                created_ts: afc_core::now_ts(),
            };
            state.next_id += 1;
            if let Some(parent) = parent_id {
                state.children.entry(parent).or_default().push(id);
            }
            state.by_created.push((entry.created_ts, id));
            state.entries.insert(id, entry.clone());
            entry
        };

        self.persist(&entry)?;
        debug!(target: "afc.archive", id = entry.id, score = entry.score, "entry added");
        Ok(entry.id)
    }

    fn persist(&self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        let line = serde_json::to_string(entry).map_err(|e| ArchiveError::Malformed {
            line: 0,
            detail: e.to_string(),
        })?;
        let mut file = self.file.lock().expect("archive file poisoned");
        writeln!(file, "{line}")
            .and_then(|()| file.sync_data())
            .map_err(|source| ArchiveError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<ArchiveEntry> {
        self.state
            .read()
            .expect("archive state poisoned")
            .entries
            .get(&id)
            .cloned()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("archive state poisoned")
            .entries
            .len()
    }

    /// Returns `true` when the archive holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lineage of `id`, ordered root-first and ending with `id` itself.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::UnknownEntry`] when `id` is absent.
    pub fn get_lineage(&self, id: u64) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let state = self.state.read().expect("archive state poisoned");
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let entry = state
                .entries
                .get(&current)
                .ok_or(ArchiveError::UnknownEntry { id: current })?;
            cursor = entry.parent_id;
            chain.push(entry.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    /// All entries beneath `root_id` (inclusive), breadth-first.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::UnknownEntry`] when `root_id` is absent.
    pub fn get_subtree(&self, root_id: u64) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let state = self.state.read().expect("archive state poisoned");
        if !state.entries.contains_key(&root_id) {
            return Err(ArchiveError::UnknownEntry { id: root_id });
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root_id]);
        while let Some(id) = queue.pop_front() {
            if let Some(entry) = state.entries.get(&id) {
                out.push(entry.clone());
            }
            if let Some(children) = state.children.get(&id) {
                queue.extend(children.iter().copied());
            }
        }
        Ok(out)
    }

    /// Entries created at or after `since_ts`, in creation order.
    #[must_use]
    pub fn created_since(&self, since_ts: f64) -> Vec<ArchiveEntry> {
        let state = self.state.read().expect("archive state poisoned");
        state
            .by_created
            .iter()
            .filter(|(ts, _)| *ts >= since_ts)
            .filter_map(|(_, id)| state.entries.get(id).cloned())
            .collect()
    }

    /// Highest score across all entries, if any exist.
    #[must_use]
    pub fn best_score(&self) -> Option<f64> {
        let state = self.state.read().expect("archive state poisoned");
        state
            .entries
            .values()
            .map(|e| e.score)
            .fold(None, |best, s| match best {
                Some(b) if b >= s => Some(b),
                _ => Some(s),
            })
    }

    /// Merkle root over all entries in id order, as lowercase hex.
    #[must_use]
    pub fn merkle_root(&self) -> String {
        let state = self.state.read().expect("archive state poisoned");
        let leaves: Vec<[u8; 32]> = state
            .entries
            .values()
            .filter_map(|e| serde_json::to_vec(e).ok())
            .map(|bytes| sha256(&bytes))
            .collect();
        merkle_root_hex(&leaves)
    }
}
