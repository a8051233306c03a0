// SPDX-License-Identifier: MIT OR Apache-2.0
//! SHA-256 helpers shared by the ledger, archive, and patch pipeline.

use sha2::{Digest, Sha256};

/// Length of a SHA-256 digest in bytes.
pub const HASH_LEN: usize = 32;

/// SHA-256 of a byte slice.
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(bytes).into()
}

/// Lowercase hex rendering of a byte slice.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Merkle root over a list of leaf hashes, as lowercase hex.
///
/// Pairs are combined with SHA-256; an odd node is duplicated. An empty
/// list yields the all-zero root.
#[must_use]
pub fn merkle_root_hex(leaves: &[[u8; HASH_LEN]]) -> String {
    if leaves.is_empty() {
        return hex(&[0u8; HASH_LEN]);
    }
    let mut level: Vec<[u8; HASH_LEN]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(right);
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    hex(&level[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex(&[0x00, 0x0f, 0xab]), "000fab");
    }

    #[test]
    fn merkle_root_of_empty_is_zero() {
        assert_eq!(merkle_root_hex(&[]), "0".repeat(64));
    }

    #[test]
    fn merkle_root_is_order_sensitive() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(merkle_root_hex(&[a, b]), merkle_root_hex(&[b, a]));
    }

    #[test]
    fn merkle_root_single_leaf_is_the_leaf() {
        let a = sha256(b"a");
        assert_eq!(merkle_root_hex(&[a]), hex(&a));
    }

    #[test]
    fn merkle_root_handles_odd_counts() {
        let leaves: Vec<_> = (0..7u8).map(|i| sha256(&[i])).collect();
        assert_eq!(merkle_root_hex(&leaves).len(), 64);
        assert_eq!(merkle_root_hex(&leaves), merkle_root_hex(&leaves));
    }
}
