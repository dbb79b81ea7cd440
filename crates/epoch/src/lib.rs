//! # merx_epoch
//!
//! The Merkle epoch builder: deterministic transform from a frozen
//! batch's (user, amount) totals to a binary Merkle tree, its root and
//! one inclusion proof per user.
//!
//! [`merkle`] holds the tree construction; the leaf hashing and proof
//! verification it must agree with live in `merx_common::merkle`, shared
//! with every verifier. [`builder`] holds the persistence-aware epoch
//! build with its idempotency and immutability guards.

pub mod builder;
pub mod merkle;

pub use builder::{build_epoch, next_epoch_number, BuildOutcome, BuildRequest};
pub use merkle::MerkleTree;
