//! # Settlement Domain Types
//!
//! Record types shared by the ledger, epoch builder, publisher and claim
//! coordinator. All are plain serde structs persisted with bincode;
//! construction validates, accessors never panic.
//!
//! ## Decimal convention
//!
//! - Ledger amounts ([`RewardEvent::amount`], [`RewardBatch`] totals)
//!   carry 6 decimals; the emission schedule's unit.
//! - Claim amounts ([`ClaimLeaf::amount_atomic`],
//!   [`ClaimEpoch::total_atomic`]) carry 9 decimals; the token mint's
//!   unit. The epoch builder converts with a checked ×[`DECIMALS_MULT`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettlementError;

/// Decimals carried by ledger amounts.
pub const LEDGER_DECIMALS: u32 = 6;
/// Decimals carried by the token mint.
pub const MINT_DECIMALS: u32 = 9;
/// Multiplier converting ledger units to mint-atomic units.
pub const DECIMALS_MULT: u64 = 10u64.pow(MINT_DECIMALS - LEDGER_DECIMALS);

// ════════════════════════════════════════════════════════════════════════════
// WEEK KEY
// ════════════════════════════════════════════════════════════════════════════

/// Business identifier of a payout cycle: `YYYY-MM-DD`, optionally split
/// into sub-periods with a `-P1` / `-P2` suffix.
///
/// Lexicographic order on the string is chronological order, so the
/// store can key batches by week directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WeekKey(String);

impl WeekKey {
    /// Parse and validate a week key.
    pub fn parse(s: &str) -> Result<Self, SettlementError> {
        let bytes = s.as_bytes();
        let valid_date = |d: &[u8]| -> bool {
            if d.len() != 10 || d[4] != b'-' || d[7] != b'-' {
                return false;
            }
            let digits = [0, 1, 2, 3, 5, 6, 8, 9];
            if !digits.iter().all(|&i| d[i].is_ascii_digit()) {
                return false;
            }
            let month = (d[5] - b'0') * 10 + (d[6] - b'0');
            let day = (d[8] - b'0') * 10 + (d[9] - b'0');
            (1..=12).contains(&month) && (1..=31).contains(&day)
        };
        let ok = match bytes.len() {
            10 => valid_date(bytes),
            13 => valid_date(&bytes[..10]) && matches!(&s[10..], "-P1" | "-P2"),
            _ => false,
        };
        if !ok {
            return Err(SettlementError::InvalidInput {
                message: format!("invalid week key {s:?} (expected YYYY-MM-DD[-P1|-P2])"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Canonical Monday week key for a unix timestamp (UTC).
    #[must_use]
    pub fn monday_from_unix(unix_secs: u64) -> Self {
        let days = (unix_secs / 86_400) as i64;
        // 1970-01-01 was a Thursday; (days + 3) % 7 == 0 on Mondays.
        let dow = (days + 3).rem_euclid(7);
        let (y, m, d) = civil_from_days(days - dow);
        Self(format!("{y:04}-{m:02}-{d:02}"))
    }

    /// The date part without any sub-period suffix.
    #[must_use]
    pub fn date(&self) -> &str {
        &self.0[..10]
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Days-since-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WeekKey {
    type Err = SettlementError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WeekKey {
    type Error = SettlementError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WeekKey> for String {
    fn from(w: WeekKey) -> Self {
        w.0
    }
}

// ════════════════════════════════════════════════════════════════════════════
// USER KEY
// ════════════════════════════════════════════════════════════════════════════

/// 32-byte wallet public key. The claimer's wallet *is* the identity in
/// the version-2 claim scheme.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserKey([u8; 32]);

impl UserKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, SettlementError> {
        Ok(Self(crate::hash::from_hex32(s)?))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for UserKey {
    /// Abbreviated form for logs; full hex via [`UserKey::to_hex`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", &self.to_hex()[..8])
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REWARD EVENTS
// ════════════════════════════════════════════════════════════════════════════

/// What a reward credit was earned for. The scoring that decides the
/// amount is external policy; events arrive with amounts attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardKind {
    Rating,
    Comment,
    Vote,
    Referral,
    Bonus,
}

impl RewardKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rating => "RATING",
            Self::Comment => "COMMENT",
            Self::Vote => "VOTE",
            Self::Referral => "REFERRAL",
            Self::Bonus => "BONUS",
        }
    }
}

/// One reward credit. Immutable once recorded; only
/// `batch_generation` is stamped when a freeze consumes the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEvent {
    pub id: Uuid,
    pub user_key: UserKey,
    pub kind: RewardKind,
    /// 6-decimal ledger units.
    pub amount: u64,
    /// Stats week the credit was earned in.
    pub source_week_key: WeekKey,
    /// Unix seconds.
    pub created_at: u64,
    /// Set when a batch freeze consumed this event.
    pub batch_generation: Option<u32>,
}

impl RewardEvent {
    pub fn new(
        user_key: UserKey,
        kind: RewardKind,
        amount: u64,
        source_week_key: WeekKey,
        created_at: u64,
    ) -> Result<Self, SettlementError> {
        if amount == 0 {
            return Err(SettlementError::InvalidInput {
                message: "reward amount must be positive".into(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_key,
            kind,
            amount,
            source_week_key,
            created_at,
            batch_generation: None,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REWARD BATCH
// ════════════════════════════════════════════════════════════════════════════

/// Batch lifecycle. OPEN exists only transiently while aggregating;
/// persisted batches are FROZEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Open,
    Frozen,
}

/// Frozen weekly totals, one row per (week, generation).
///
/// Generation 0 is the canonical batch. A forced rerun appends a new
/// generation instead of mutating history; the duplicate-payout risk of
/// rerunning is explicit, not hidden behind an overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBatch {
    /// Payout week this batch settles.
    pub week_key: WeekKey,
    pub generation: u32,
    pub status: BatchStatus,
    /// Stats week the totals were computed from. Differs from
    /// `week_key` only for makeup payouts.
    pub source_week_key: WeekKey,
    /// Per-user totals in 6-decimal ledger units. BTreeMap keeps the
    /// iteration order deterministic.
    pub totals_by_user: BTreeMap<UserKey, u64>,
    /// Sum of `totals_by_user` values, 6-decimal units.
    pub total_amount: u64,
    pub event_count: u64,
    pub created_at: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// CLAIM EPOCH / LEAF / RECEIPT
// ════════════════════════════════════════════════════════════════════════════

/// Claim scheme version. V1 leaves are unsalted (legacy epochs still
/// verify); V2 adds a per-(epoch, user) salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochVersion {
    V1,
    V2,
}

impl EpochVersion {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, SettlementError> {
        match v {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(SettlementError::InvalidInput {
                message: format!("unknown claim version {other}"),
            }),
        }
    }
}

/// One frozen, Merkle-committed batch of claimable rewards.
///
/// Immutable after creation except the one-way `set_on_chain`
/// false→true transition (performed only by the store's mark operation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEpoch {
    /// Global monotonic number, never reused.
    pub epoch: u64,
    pub week_key: WeekKey,
    pub version: EpochVersion,
    pub root: [u8; 32],
    pub leaf_count: u32,
    /// 9-decimal mint-atomic units.
    pub total_atomic: u64,
    /// Commitment to the input set; unchanged inputs ⇒ unchanged hash,
    /// which makes rebuild-until-published idempotent.
    pub build_hash: [u8; 32],
    /// Which batch generation the epoch was built from.
    pub batch_generation: u32,
    pub set_on_chain: bool,
    pub on_chain_tx_sig: Option<String>,
    pub created_at: u64,
}

impl ClaimEpoch {
    #[must_use]
    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }

    /// Claims are accepted only once the root is committed on-chain.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        self.set_on_chain
    }
}

/// A single user's allocation inside an epoch, with its inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLeaf {
    pub epoch: u64,
    pub user_key: UserKey,
    /// 9-decimal mint-atomic units.
    pub amount_atomic: u64,
    /// Position in the sorted leaf set.
    pub index: u32,
    /// Per-(epoch, user) secret; `None` for version-1 epochs.
    pub salt: Option<[u8; 32]>,
    /// Sibling hashes from leaf to root.
    pub proof: Vec<[u8; 32]>,
}

/// Durable record that (epoch, user) has been paid out. The store's
/// uniqueness constraint on this row is the double-payment guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub epoch: u64,
    pub user_key: UserKey,
    pub tx_sig: String,
    /// Wallet the tokens were transferred to.
    pub claimed_to: UserKey,
    pub amount_atomic: u64,
    pub confirmed_at: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
