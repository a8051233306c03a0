// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ledger integrity and Merkle-audit scenarios.

use afc_config::Settings;
use afc_core::hash::HASH_LEN;
use afc_ledger::{Ledger, chain_hash, merkle_root_hex, read_all};
use afc_registry::{AgentMetadata, StubAgent};
use afc_supervisor::Orchestrator;

fn settings(dir: &tempfile::TempDir) -> Settings {
    Settings {
        ledger_path: dir.path().join("audit.ledger"),
        archive_path: dir.path().join("archive.jsonl"),
        address_space_limit: None,
        ..Settings::default()
    }
}

// ---------------------------------------------------------------------------
// 6. Merkle mismatch slashes the named agent by 10% and nobody else
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bogus_root_slashes_only_the_named_agent() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(settings(&dir)).unwrap();
    for name in ["a", "b", "c"] {
        orch.add_agent(AgentMetadata::new(name, "1.0.0"), StubAgent::factory(name))
            .await
            .unwrap();
    }

    assert!(!orch.verify_ledger("bogus", "a").await.unwrap());
    assert!((orch.stake().stake("a").unwrap() - 0.9).abs() < 1e-12);
    assert_eq!(orch.stake().stake("b"), Some(1.0));
    assert_eq!(orch.stake().stake("c"), Some(1.0));
}

// ---------------------------------------------------------------------------
// Every ledger prefix satisfies the chain-hash invariant
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_hashes_validate_over_every_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.ledger");
    let ledger = Ledger::open(&path).unwrap();
    for i in 0..16u64 {
        ledger
            .append(serde_json::json!({"event": "tick", "n": i}), i as f64)
            .await
            .unwrap();
    }
    drop(ledger);

    let entries = read_all(&path).unwrap();
    assert_eq!(entries.len(), 16);
    let mut prev = [0u8; HASH_LEN];
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.seq, i as u64 + 1, "seq must be gap-free");
        let body = serde_json::to_vec(&entry.body).unwrap();
        assert_eq!(
            entry.hash_self,
            chain_hash(entry.seq, entry.ts, &body, &prev),
            "hash_self must cover seq, ts, body, and hash_prev"
        );
        prev = entry.hash_self;
    }
}

// ---------------------------------------------------------------------------
// The published root matches an out-of-process recomputation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn external_verifier_reproduces_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.ledger");
    let ledger = Ledger::open(&path).unwrap();
    for i in 0..5u64 {
        ledger
            .append(serde_json::json!({"n": i}), i as f64)
            .await
            .unwrap();
    }
    let root = ledger.merkle_root().await.unwrap();
    drop(ledger);

    let leaves: Vec<_> = read_all(&path).unwrap().iter().map(|e| e.hash_self).collect();
    assert_eq!(root, merkle_root_hex(&leaves));

    // A verified root passes through the orchestrator without slashing.
    let mut s = settings(&dir);
    s.ledger_path = path;
    let orch = Orchestrator::new(s).unwrap();
    orch.add_agent(AgentMetadata::new("a", "1.0.0"), StubAgent::factory("a"))
        .await
        .unwrap();
    let root = orch.ledger().merkle_root().await.unwrap();
    assert!(orch.verify_ledger(&root, "a").await.unwrap());
    assert_eq!(orch.stake().stake("a"), Some(1.0));
}

// ---------------------------------------------------------------------------
// Tampering is caught on reopen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tampered_ledgers_refuse_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.ledger");
    let ledger = Ledger::open(&path).unwrap();
    ledger
        .append(serde_json::json!({"secret": "original"}), 1.0)
        .await
        .unwrap();
    drop(ledger);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    assert!(read_all(&path).is_err());
    assert!(Ledger::open(&path).is_err());
}
