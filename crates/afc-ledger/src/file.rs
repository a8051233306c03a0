// SPDX-License-Identifier: MIT OR Apache-2.0
//! Synchronous append-only ledger file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::frame::{FrameError, HASH_LEN, LedgerEntry, merkle_root_hex};

/// Errors from ledger file operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerFileError {
    /// Underlying filesystem failure.
    #[error("ledger I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// A stored frame failed validation.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// An open append-only ledger file.
///
/// Appends write one frame and fsync before returning, so a committed `seq`
/// survives a crash. Entry hashes are kept in memory for Merkle-root
/// computation.
#[derive(Debug)]
pub struct LedgerFile {
    file: File,
    path: PathBuf,
    next_seq: u64,
    last_hash: [u8; HASH_LEN],
    hashes: Vec<[u8; HASH_LEN]>,
}

impl LedgerFile {
    /// Open or create the ledger at `path`, validating any existing chain.
    ///
    /// # Errors
    ///
    /// I/O failures (including a missing parent directory) and any frame
    /// that fails hash or ordering validation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerFileError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            read_all(&path)?
        } else {
            Vec::new()
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerFileError::Io {
                path: path.clone(),
                source,
            })?;
        let last_hash = entries
            .last()
            .map_or([0u8; HASH_LEN], |e| e.hash_self);
        let next_seq = entries.last().map_or(1, |e| e.seq + 1);
        let hashes = entries.iter().map(|e| e.hash_self).collect();
        Ok(Self {
            file,
            path,
            next_seq,
            last_hash,
            hashes,
        })
    }

    /// Append a body, committing with fsync, and return the assigned `seq`.
    ///
    /// # Errors
    ///
    /// Serialisation or I/O failure. After an I/O error the file position is
    /// unspecified and the ledger must be considered unavailable.
    pub fn append(&mut self, body: serde_json::Value, ts: f64) -> Result<u64, LedgerFileError> {
        let entry = LedgerEntry::create(self.next_seq, ts, body, self.last_hash)?;
        let buf = entry.encode()?;
        self.file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data())
            .map_err(|source| LedgerFileError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.last_hash = entry.hash_self;
        self.hashes.push(entry.hash_self);
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.hashes.len() as u64
    }

    /// Returns `true` when no entries have been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Merkle root over the current entries, as lowercase hex.
    #[must_use]
    pub fn merkle_root(&self) -> String {
        merkle_root_hex(&self.hashes)
    }
}

/// Read and validate every entry in a ledger file.
///
/// Validation covers the per-frame chain hash, the strictly increasing
/// gap-free `seq`, and the `hash_prev` linkage.
///
/// # Errors
///
/// I/O failures and the first frame that fails validation.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, LedgerFileError> {
    let path = path.as_ref();
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(|source| LedgerFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut entries = Vec::new();
    let mut offset = 0;
    let mut last_hash = [0u8; HASH_LEN];
    let mut expected_seq = 1u64;
    while offset < buf.len() {
        let (entry, consumed) = LedgerEntry::decode(&buf[offset..])?;
        if entry.seq != expected_seq {
            return Err(FrameError::BrokenChain {
                seq: entry.seq,
                detail: format!("expected seq {expected_seq}"),
            }
            .into());
        }
        if entry.hash_prev != last_hash {
            return Err(FrameError::BrokenChain {
                seq: entry.seq,
                detail: "hash_prev does not match previous entry".into(),
            }
            .into());
        }
        last_hash = entry.hash_self;
        expected_seq += 1;
        offset += consumed;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_assign_sequential_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = LedgerFile::open(dir.path().join("l.bin")).unwrap();
        for i in 1..=5u64 {
            let seq = ledger
                .append(serde_json::json!({"n": i}), i as f64)
                .unwrap();
            assert_eq!(seq, i);
        }
        assert_eq!(ledger.len(), 5);
    }

    #[test]
    fn reopen_validates_and_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let root_before;
        {
            let mut ledger = LedgerFile::open(&path).unwrap();
            ledger.append(serde_json::json!({"a": 1}), 1.0).unwrap();
            ledger.append(serde_json::json!({"b": 2}), 2.0).unwrap();
            root_before = ledger.merkle_root();
        }
        let mut ledger = LedgerFile::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.merkle_root(), root_before);
        assert_eq!(ledger.append(serde_json::json!({"c": 3}), 3.0).unwrap(), 3);

        let entries = read_all(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].hash_prev, entries[1].hash_self);
    }

    #[test]
    fn chain_prefix_hashes_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let mut ledger = LedgerFile::open(&path).unwrap();
        for i in 0..10 {
            ledger.append(serde_json::json!({"i": i}), i as f64).unwrap();
        }
        drop(ledger);
        let entries = read_all(&path).unwrap();
        let mut prev = [0u8; HASH_LEN];
        for e in &entries {
            assert_eq!(e.hash_prev, prev);
            prev = e.hash_self;
        }
    }

    #[test]
    fn corruption_is_detected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let mut ledger = LedgerFile::open(&path).unwrap();
        ledger
            .append(serde_json::json!({"x": "payload"}), 1.0)
            .unwrap();
        drop(ledger);

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(read_all(&path).is_err());
    }

    #[test]
    fn merkle_root_changes_with_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = LedgerFile::open(dir.path().join("l.bin")).unwrap();
        let mut roots = std::collections::HashSet::new();
        assert!(roots.insert(ledger.merkle_root()));
        for i in 0..4 {
            ledger.append(serde_json::json!({"i": i}), i as f64).unwrap();
            assert!(roots.insert(ledger.merkle_root()), "root repeated");
        }
    }

    #[test]
    fn missing_parent_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("l.bin");
        assert!(matches!(
            LedgerFile::open(path),
            Err(LedgerFileError::Io { .. })
        ));
    }
}
