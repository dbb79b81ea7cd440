//! # Epoch Builder
//!
//! Persistence-aware construction of a claim epoch from a frozen
//! batch's totals.
//!
//! ## Guards
//!
//! - Nothing to build → `NO_PAID_REWARDS`, no row written.
//! - Epoch already on-chain → `EPOCH_ALREADY_ON_CHAIN`; the builder
//!   never produces silently-different output for a committed root.
//! - Unchanged inputs (same build hash) → `Skipped` with the existing
//!   root, because rebuilding would invalidate distributed proofs.
//! - Changed inputs before publication → rebuild in place under the
//!   same epoch number, reusing the stored per-(epoch, user) salts.
//!
//! ## Numbering
//!
//! Epoch numbers are global and never reused. The next number is
//! `max(latest in store, latest visible on-chain) + 1`; the chain side
//! is a bounded forward scan that tolerates gaps, so a store that lags
//! the chain can never hand out a number the chain already has.

use rand::RngCore;
use tracing::info;

use merx_common::hash::keccak_hashv;
use merx_common::merkle::{leaf_hash_v1, leaf_hash_v2};
use merx_common::{
    ChainGateway, ClaimEpoch, ClaimLeaf, EpochVersion, SettlementError, UserKey, WeekKey,
    DECIMALS_MULT,
};
use merx_store::SettlementDb;

use crate::merkle::MerkleTree;

/// Stop the on-chain scan after this many consecutive missing epochs.
const MAX_SCAN_GAPS: u32 = 10;
/// Absolute bound on the on-chain scan.
const MAX_SCAN: u64 = 1024;

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub week_key: WeekKey,
    pub version: EpochVersion,
    /// Batch generation to settle; defaults to the latest frozen one.
    pub generation: Option<u32>,
}

/// Result of a build call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A new or rebuilt epoch was persisted.
    Built { epoch: ClaimEpoch },
    /// An identical epoch already exists; nothing was rewritten.
    Skipped { epoch: ClaimEpoch },
}

impl BuildOutcome {
    #[must_use]
    pub fn epoch(&self) -> &ClaimEpoch {
        match self {
            Self::Built { epoch } | Self::Skipped { epoch } => epoch,
        }
    }

    #[must_use]
    pub fn skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Next safe epoch number from both the store and the chain.
pub async fn next_epoch_number(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
) -> Result<u64, SettlementError> {
    let db_latest = db.latest_epoch()?.map_or(0, |e| e.epoch);

    let mut chain_latest = 0u64;
    if gateway.epoch_root(1).await?.is_some() {
        chain_latest = 1;
        let mut gaps = 0u32;
        for number in 2..=MAX_SCAN {
            if gateway.epoch_root(number).await?.is_some() {
                chain_latest = number;
                gaps = 0;
            } else {
                gaps += 1;
                if gaps >= MAX_SCAN_GAPS {
                    break;
                }
            }
        }
    }

    Ok(db_latest.max(chain_latest) + 1)
}

/// Commitment to the build inputs. Same inputs ⇒ same hash, which is
/// what makes rebuild-until-published idempotent.
fn compute_build_hash(
    epoch: u64,
    week_key: &WeekKey,
    version: EpochVersion,
    generation: u32,
    rows: &[(UserKey, u64)],
) -> [u8; 32] {
    let epoch_le = epoch.to_le_bytes();
    let generation_le = generation.to_le_bytes();
    let version_byte = [version.as_u8()];
    let mut parts: Vec<&[u8]> = vec![
        &epoch_le,
        week_key.as_str().as_bytes(),
        &version_byte,
        &generation_le,
    ];
    let amount_bytes: Vec<[u8; 8]> = rows.iter().map(|(_, a)| a.to_le_bytes()).collect();
    for ((user, _), amount_le) in rows.iter().zip(&amount_bytes) {
        parts.push(user.as_bytes());
        parts.push(amount_le);
    }
    keccak_hashv(&parts)
}

/// Build (or idempotently skip) the claim epoch for a week.
pub async fn build_epoch(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
    request: &BuildRequest,
    now: u64,
) -> Result<BuildOutcome, SettlementError> {
    // ── resolve the batch generation ────────────────────────────────────
    let generation = match request.generation {
        Some(g) => g,
        None => match db.latest_batch_generation(&request.week_key)? {
            Some(g) => g,
            None => {
                return Err(SettlementError::NoPaidRewards {
                    week_key: request.week_key.to_string(),
                })
            }
        },
    };
    let batch = db
        .get_batch(&request.week_key, generation)?
        .ok_or_else(|| SettlementError::NoPaidRewards {
            week_key: request.week_key.to_string(),
        })?;

    // Canonical ordering: BTreeMap iterates user keys ascending, so the
    // leaf order is reproducible from the same input set regardless of
    // how events arrived.
    let mut rows: Vec<(UserKey, u64)> = Vec::with_capacity(batch.totals_by_user.len());
    for (user, amount6) in &batch.totals_by_user {
        if *amount6 == 0 {
            continue;
        }
        let atomic =
            amount6
                .checked_mul(DECIMALS_MULT)
                .ok_or_else(|| SettlementError::InvalidInput {
                    message: format!("amount overflow converting {amount6} to mint units"),
                })?;
        rows.push((*user, atomic));
    }
    if rows.is_empty() {
        return Err(SettlementError::NoPaidRewards {
            week_key: request.week_key.to_string(),
        });
    }

    // ── idempotency / immutability guards ───────────────────────────────
    let existing = db.epoch_for_week(&request.week_key, request.version)?;
    if let Some(ref e) = existing {
        if e.set_on_chain {
            return Err(SettlementError::EpochAlreadyOnChain { epoch: e.epoch });
        }
    }

    let epoch_number = match existing {
        Some(ref e) => e.epoch,
        None => next_epoch_number(db, gateway).await?,
    };

    let build_hash = compute_build_hash(
        epoch_number,
        &request.week_key,
        request.version,
        generation,
        &rows,
    );
    if let Some(e) = existing {
        if e.build_hash == build_hash {
            info!(epoch = e.epoch, week = %e.week_key, "epoch build skipped, inputs unchanged");
            return Ok(BuildOutcome::Skipped { epoch: e });
        }
    }

    // ── leaves ──────────────────────────────────────────────────────────
    let mut leaf_hashes = Vec::with_capacity(rows.len());
    let mut leaves = Vec::with_capacity(rows.len());
    let mut total_atomic: u64 = 0;

    for (i, (user, amount_atomic)) in rows.iter().enumerate() {
        let index = i as u32;
        let salt = match request.version {
            EpochVersion::V1 => None,
            EpochVersion::V2 => Some(get_or_create_salt(db, epoch_number, user)?),
        };
        let hash = match salt {
            Some(ref s) => leaf_hash_v2(user, epoch_number, *amount_atomic, index, s),
            None => leaf_hash_v1(user, epoch_number, *amount_atomic, index),
        };
        leaf_hashes.push(hash);
        total_atomic =
            total_atomic
                .checked_add(*amount_atomic)
                .ok_or_else(|| SettlementError::InvalidInput {
                    message: "epoch total overflows u64".into(),
                })?;
        leaves.push(ClaimLeaf {
            epoch: epoch_number,
            user_key: *user,
            amount_atomic: *amount_atomic,
            index,
            salt,
            proof: Vec::new(),
        });
    }

    let tree = MerkleTree::build(leaf_hashes);
    for (i, leaf) in leaves.iter_mut().enumerate() {
        leaf.proof = tree.proof(i);
    }

    let epoch = ClaimEpoch {
        epoch: epoch_number,
        week_key: request.week_key.clone(),
        version: request.version,
        root: tree.root(),
        leaf_count: leaves.len() as u32,
        total_atomic,
        build_hash,
        batch_generation: generation,
        set_on_chain: false,
        on_chain_tx_sig: None,
        created_at: now,
    };
    db.store_epoch_build(&epoch, &leaves)?;

    info!(
        epoch = epoch.epoch,
        week = %epoch.week_key,
        version = epoch.version.as_u8(),
        leaves = epoch.leaf_count,
        total = epoch.total_atomic,
        root = %epoch.root_hex(),
        "epoch built"
    );
    Ok(BuildOutcome::Built { epoch })
}

/// Salts survive pre-publication rebuilds: generated once per
/// (epoch, user), then reused.
fn get_or_create_salt(
    db: &SettlementDb,
    epoch: u64,
    user: &UserKey,
) -> Result<[u8; 32], SettlementError> {
    if let Some(salt) = db.get_salt(epoch, user)? {
        return Ok(salt);
    }
    let mut salt = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    db.put_salt(epoch, user, &salt)?;
    Ok(salt)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
