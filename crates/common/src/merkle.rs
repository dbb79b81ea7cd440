//! # Merkle Verification Primitives
//!
//! Leaf hashing and proof verification shared by the epoch builder, the
//! claim coordinator and the mock chain. Builder and verifier MUST be
//! byte-for-byte identical; that is why these live in the common crate
//! and nowhere else.
//!
//! ## Canonical layout
//!
//! Leaf v1: `keccak(user_key(32) ‖ epoch u64 LE ‖ amount u64 LE ‖ index u32 LE)`
//! Leaf v2: v1 layout ‖ `salt(32)` appended before hashing.
//!
//! Interior node: the sibling pair is sorted by byte value, then
//! `keccak(min ‖ max)`. Verification therefore needs only sibling
//! values; no left/right bookkeeping, no leaf index.

use crate::hash::keccak_hashv;
use crate::types::UserKey;

/// Version-1 (legacy, unsalted) leaf hash.
///
/// The epoch number is bound into the leaf, so a proof for one epoch can
/// never validate against another epoch's root.
#[must_use]
pub fn leaf_hash_v1(user_key: &UserKey, epoch: u64, amount_atomic: u64, index: u32) -> [u8; 32] {
    keccak_hashv(&[
        user_key.as_bytes(),
        &epoch.to_le_bytes(),
        &amount_atomic.to_le_bytes(),
        &index.to_le_bytes(),
    ])
}

/// Version-2 (salted) leaf hash. The per-(epoch, user) salt defeats
/// proof replay across claim contexts.
#[must_use]
pub fn leaf_hash_v2(
    user_key: &UserKey,
    epoch: u64,
    amount_atomic: u64,
    index: u32,
    salt: &[u8; 32],
) -> [u8; 32] {
    keccak_hashv(&[
        user_key.as_bytes(),
        &epoch.to_le_bytes(),
        &amount_atomic.to_le_bytes(),
        &index.to_le_bytes(),
        salt,
    ])
}

/// Interior node hash with order-independent pairing.
#[must_use]
pub fn parent_hash(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    if a <= b {
        keccak_hashv(&[a, b])
    } else {
        keccak_hashv(&[b, a])
    }
}

/// Recompute the root from a leaf and its sibling path.
///
/// The proof is the ordered list of sibling hashes from leaf level to
/// the root. A level where the node was promoted (odd node out) simply
/// contributes no sibling, so promotion needs no marker in the proof.
#[must_use]
pub fn fold_proof(leaf: [u8; 32], proof: &[[u8; 32]]) -> [u8; 32] {
    let mut node = leaf;
    for sibling in proof {
        node = parent_hash(&node, sibling);
    }
    node
}

/// Whether `proof` connects `leaf` to `root`.
#[must_use]
pub fn verify_proof(leaf: [u8; 32], proof: &[[u8; 32]], root: &[u8; 32]) -> bool {
    fold_proof(leaf, proof) == *root
}
