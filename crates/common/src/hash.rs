//! Keccak-256 hashing and 32-byte hex helpers.
//!
//! The settlement program on-chain hashes with keccak, so every hash in
//! the epoch pipeline is Keccak-256; leaf, interior node, build hash.
//! One algorithm end to end keeps the builder and every verifier
//! byte-identical.

use sha3::{Digest, Keccak256};

use crate::error::SettlementError;

/// Keccak-256 of a single buffer.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keccak-256 over concatenated parts without intermediate allocation.
///
/// Mirrors the on-chain `hashv` entry point: `hashv(&[a, b, c])` is
/// identical to hashing `a ‖ b ‖ c`.
#[must_use]
pub fn keccak_hashv(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex of a 32-byte value, no prefix.
#[must_use]
pub fn hex32(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

/// Parse a 32-byte hex string, tolerating an optional `0x` prefix.
pub fn from_hex32(s: &str) -> Result<[u8; 32], SettlementError> {
    let h = s.strip_prefix("0x").unwrap_or(s);
    if h.len() != 64 {
        return Err(SettlementError::InvalidInput {
            message: format!("expected 64 hex chars, got {}", h.len()),
        });
    }
    let raw = hex::decode(h).map_err(|e| SettlementError::InvalidInput {
        message: format!("invalid hex: {e}"),
    })?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&raw);
    Ok(out)
}
