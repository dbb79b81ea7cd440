//! # Settlement Error Taxonomy
//!
//! Satu enum error untuk seluruh boundary antar-crate. Setiap failure
//! path mengembalikan hasil typed; tidak ada opaque exception yang
//! menyeberangi service boundary.
//!
//! ## Classes
//!
//! | Class | Meaning | Caller behaviour |
//! |-------|---------|------------------|
//! | Policy | caller must change input | surfaced verbatim, never retried |
//! | Transient | chain has not made the result visible yet | bounded backoff retry; exhausted ⇒ "pending" |
//! | Hard | structurally invalid claim/transaction | fatal for the attempt, never retried |
//! | Infra | store/chain plumbing failure | chain side retryable, store side not |
//!
//! Setiap variant punya wire code stabil (`code()`) yang dipakai apa
//! adanya di response HTTP `{ok:false, error}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`SettlementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Caller must change input; retrying verbatim cannot succeed.
    Policy,
    /// Chain visibility lag; retrying with backoff may succeed.
    Transient,
    /// Structurally invalid; retrying cannot change the outcome.
    Hard,
    /// Plumbing failure outside the claim's own semantics.
    Infra,
}

/// All failure modes of the settlement engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SettlementError {
    // ── POLICY ──────────────────────────────────────────────────────────
    /// A FROZEN batch already exists for this week (generation 0).
    #[error("batch already frozen for week {week_key}")]
    BatchExists { week_key: String },

    /// Epoch exists but its root is not on-chain yet.
    #[error("epoch {epoch} is not claimable (root not on-chain)")]
    EpochNotClaimable { epoch: u64 },

    /// A receipt already exists for (epoch, user). From the caller's
    /// point of view the claim already happened; idempotent success.
    #[error("epoch {epoch} already claimed by {user_key_hex}")]
    AlreadyClaimed { epoch: u64, user_key_hex: String },

    /// No frozen, unepoched reward totals for the week.
    #[error("no paid rewards for week {week_key}")]
    NoPaidRewards { week_key: String },

    /// The connected wallet is not the wallet that earned the leaf.
    #[error("wallet mismatch: leaf belongs to {expected_hex}, claimer is {actual_hex}")]
    WalletMismatch {
        expected_hex: String,
        actual_hex: String,
    },

    /// No such epoch in the store.
    #[error("epoch {epoch} not found")]
    EpochNotFound { epoch: u64 },

    /// The epoch exists but holds no leaf for this user.
    #[error("no claim for user {user_key_hex} in epoch {epoch}")]
    NoClaimForUser { epoch: u64, user_key_hex: String },

    /// The epoch is already committed on-chain and is immutable.
    #[error("epoch {epoch} is already on-chain and cannot be rebuilt")]
    EpochAlreadyOnChain { epoch: u64 },

    /// Makeup payout refused: the payout week already settled on-chain.
    #[error("payout week {week_key} already has on-chain epoch {epoch}")]
    PayoutWeekOnChain { week_key: String, epoch: u64 },

    /// The on-chain epoch root account does not exist yet.
    #[error("epoch root for {epoch} is not set on-chain")]
    EpochRootNotSet { epoch: u64 },

    /// Stored root and on-chain root disagree. The epoch may have been
    /// rebuilt after publication; refuse to mark.
    #[error("root mismatch for epoch {epoch}: store {expected_hex}, chain {on_chain_hex}")]
    RootMismatch {
        epoch: u64,
        expected_hex: String,
        on_chain_hex: String,
    },

    /// Destructive reset refused (on-chain payouts cannot be undone).
    #[error("reset refused for week {week_key}: {reason}")]
    ResetForbidden { week_key: String, reason: String },

    /// Malformed caller input (bad hex, bad week key, zero amount, ...).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    // ── TRANSIENT ───────────────────────────────────────────────────────
    /// The transaction was broadcast but is not visible to this
    /// confirmation path yet.
    #[error("transaction {signature} not found on-chain yet")]
    TxNotFound { signature: String },

    /// The claim's on-chain receipt account is not visible yet.
    #[error("on-chain receipt for epoch {epoch} / {user_key_hex} not visible yet")]
    ReceiptMissing { epoch: u64, user_key_hex: String },

    // ── HARD ────────────────────────────────────────────────────────────
    /// Merkle proof does not recompute to the epoch root.
    #[error("merkle proof invalid for epoch {epoch}")]
    BadProof { epoch: u64 },

    /// On-chain evidence carries a different amount than the leaf.
    #[error("amount mismatch: leaf {expected}, evidence {actual}")]
    AmountMismatch { expected: u64, actual: u64 },

    /// On-chain evidence carries a different leaf index.
    #[error("index mismatch: leaf {expected}, evidence {actual}")]
    IndexMismatch { expected: u32, actual: u32 },

    /// The transaction executed and failed; retrying cannot fix it.
    #[error("transaction {signature} failed on-chain: {reason}")]
    TxFailed { signature: String, reason: String },

    // ── INFRA ───────────────────────────────────────────────────────────
    /// Persistence failure (LMDB / serialization).
    #[error("store error: {message}")]
    Store { message: String },

    /// Chain RPC failure (network, timeout, malformed response).
    #[error("chain error: {message}")]
    Chain { message: String },
}

impl SettlementError {
    /// Stable wire code for the HTTP `{ok:false, error}` field.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BatchExists { .. } => "BATCH_EXISTS",
            Self::EpochNotClaimable { .. } => "EPOCH_NOT_CLAIMABLE",
            Self::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            Self::NoPaidRewards { .. } => "NO_PAID_REWARDS",
            Self::WalletMismatch { .. } => "WALLET_MISMATCH",
            Self::EpochNotFound { .. } => "EPOCH_NOT_FOUND",
            Self::NoClaimForUser { .. } => "NO_CLAIM_FOR_USER",
            Self::EpochAlreadyOnChain { .. } => "EPOCH_ALREADY_ON_CHAIN",
            Self::PayoutWeekOnChain { .. } => "PAYOUT_WEEK_ON_CHAIN",
            Self::EpochRootNotSet { .. } => "EPOCH_ROOT_NOT_SET",
            Self::RootMismatch { .. } => "ROOT_MISMATCH",
            Self::ResetForbidden { .. } => "RESET_FORBIDDEN",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::TxNotFound { .. } => "TX_NOT_FOUND",
            Self::ReceiptMissing { .. } => "RECEIPT_MISSING",
            Self::BadProof { .. } => "BAD_PROOF",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::IndexMismatch { .. } => "INDEX_MISMATCH",
            Self::TxFailed { .. } => "TX_FAILED",
            Self::Store { .. } => "STORE_ERROR",
            Self::Chain { .. } => "CHAIN_ERROR",
        }
    }

    /// Classification driving retry behaviour.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BatchExists { .. }
            | Self::EpochNotClaimable { .. }
            | Self::AlreadyClaimed { .. }
            | Self::NoPaidRewards { .. }
            | Self::WalletMismatch { .. }
            | Self::EpochNotFound { .. }
            | Self::NoClaimForUser { .. }
            | Self::EpochAlreadyOnChain { .. }
            | Self::PayoutWeekOnChain { .. }
            | Self::EpochRootNotSet { .. }
            | Self::RootMismatch { .. }
            | Self::ResetForbidden { .. }
            | Self::InvalidInput { .. } => ErrorClass::Policy,
            Self::TxNotFound { .. } | Self::ReceiptMissing { .. } => ErrorClass::Transient,
            Self::BadProof { .. }
            | Self::AmountMismatch { .. }
            | Self::IndexMismatch { .. }
            | Self::TxFailed { .. } => ErrorClass::Hard,
            Self::Store { .. } | Self::Chain { .. } => ErrorClass::Infra,
        }
    }

    /// Whether a bounded-backoff retry may change the outcome.
    ///
    /// Transient chain-visibility errors and chain RPC failures are
    /// retryable. Store errors are not: the local database does not heal
    /// by waiting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient) || matches!(self, Self::Chain { .. })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
