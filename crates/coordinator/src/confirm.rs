//! # Claim Confirmation
//!
//! Bridges a synchronous user-facing request with the chain's
//! asynchronous, eventually-consistent view of an executed claim.
//!
//! State machine per (epoch, user):
//!
//! ```text
//! UNCLAIMED → SUBMITTED → { CONFIRMED
//!                         | NOT_YET_VISIBLE → CONFIRMED
//!                         | FAILED }
//! ```
//!
//! The coordinator is stateless across retries. It does not remember
//! in-flight attempts and holds no lock while waiting: uniqueness is
//! enforced by the receipt constraint in the store, so concurrent
//! confirmations for the same (epoch, user) race on the insert and
//! every loser is told `ALREADY_CLAIMED`.

use tracing::{info, warn};

use merx_common::{
    retry_with_backoff, ChainGateway, ClaimReceipt, ErrorClass, RetryConfig, RetryResult,
    SettlementError, UserKey,
};
use merx_store::SettlementDb;

/// One claim confirmation request.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Signature of the transaction the wallet submitted.
    pub signature: String,
    pub epoch: u64,
    /// Identity the leaf is keyed by.
    pub user_key: UserKey,
    /// Wallet that signed and should have received the tokens.
    pub claimer: UserKey,
}

/// Terminal outcome of a confirmation (after retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Receipt inserted; this call settled the claim.
    Confirmed {
        receipt: ClaimReceipt,
        attempts: u32,
    },
    /// A receipt already existed (or a concurrent call won the race).
    /// Idempotent success from the caller's point of view.
    AlreadyClaimed { receipt: Option<ClaimReceipt> },
    /// Retries exhausted on a transient error. NOT a failure: the
    /// transaction may still land, and re-confirming later is safe.
    Pending {
        attempts: u32,
        last_error: SettlementError,
    },
    /// Hard or policy failure; retrying the same input cannot succeed.
    Failed { error: SettlementError },
}

impl ClaimOutcome {
    /// Wire status string for API responses.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Confirmed { .. } => "CONFIRMED",
            Self::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            Self::Pending { .. } => "PENDING",
            Self::Failed { .. } => "FAILED",
        }
    }
}

/// Single confirmation attempt.
///
/// Read-only validation happens first; the receipt insert is the only
/// mutation and the linearization point. Any error before the insert
/// leaves no trace.
pub async fn confirm_claim(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
    request: &ClaimRequest,
    now: u64,
) -> Result<ClaimReceipt, SettlementError> {
    // 1. The epoch must exist and be committed on-chain.
    let epoch = db
        .get_epoch(request.epoch)?
        .ok_or(SettlementError::EpochNotFound {
            epoch: request.epoch,
        })?;
    if !epoch.is_claimable() {
        return Err(SettlementError::EpochNotClaimable {
            epoch: request.epoch,
        });
    }

    // 2. Fast path: the claim already settled.
    if db.get_receipt(request.epoch, &request.user_key)?.is_some() {
        return Err(SettlementError::AlreadyClaimed {
            epoch: request.epoch,
            user_key_hex: request.user_key.to_hex(),
        });
    }

    // 3. The user must hold a leaf in this epoch.
    let leaf = db
        .get_leaf(request.epoch, &request.user_key)?
        .ok_or_else(|| SettlementError::NoClaimForUser {
            epoch: request.epoch,
            user_key_hex: request.user_key.to_hex(),
        })?;

    // 4. On-chain evidence. TxNotFound / ReceiptMissing propagate as
    //    retryable; TxFailed and chain errors propagate as-is.
    let evidence = gateway
        .claim_evidence(request.epoch, &request.user_key, &request.signature)
        .await?;

    if evidence.amount_atomic != leaf.amount_atomic {
        return Err(SettlementError::AmountMismatch {
            expected: leaf.amount_atomic,
            actual: evidence.amount_atomic,
        });
    }
    if evidence.index != leaf.index {
        return Err(SettlementError::IndexMismatch {
            expected: leaf.index,
            actual: evidence.index,
        });
    }
    if evidence.claimed_to != request.claimer {
        return Err(SettlementError::WalletMismatch {
            expected_hex: evidence.claimed_to.to_hex(),
            actual_hex: request.claimer.to_hex(),
        });
    }

    // 5. The sole mutation. Concurrent confirmations race here; the
    //    constraint decides the winner.
    let receipt = ClaimReceipt {
        epoch: request.epoch,
        user_key: request.user_key,
        // The evidence's signature is authoritative: the claim may have
        // landed through a different transaction than the caller's.
        tx_sig: evidence.signature,
        claimed_to: evidence.claimed_to,
        amount_atomic: evidence.amount_atomic,
        confirmed_at: now,
    };
    db.insert_receipt(&receipt)?;

    info!(
        epoch = request.epoch,
        user = %request.user_key,
        amount = receipt.amount_atomic,
        "claim confirmed"
    );
    Ok(receipt)
}

/// Confirmation with the injected backoff policy.
///
/// Only transient errors are retried. Exhaustion reports
/// [`ClaimOutcome::Pending`], never `Failed`; the underlying
/// transaction may still land, and the receipt constraint makes a later
/// re-confirmation safe.
pub async fn confirm_claim_with_retry(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
    request: &ClaimRequest,
    retry: &RetryConfig,
    now: u64,
) -> ClaimOutcome {
    let result = retry_with_backoff(retry, SettlementError::is_retryable, || {
        confirm_claim(db, gateway, request, now)
    })
    .await;

    match result {
        RetryResult::Success { value, attempts } => ClaimOutcome::Confirmed {
            receipt: value,
            attempts,
        },
        RetryResult::Exhausted {
            last_error,
            attempts,
        } => match last_error {
            SettlementError::AlreadyClaimed { .. } => {
                let receipt = db.get_receipt(request.epoch, &request.user_key).ok().flatten();
                ClaimOutcome::AlreadyClaimed { receipt }
            }
            e if e.is_retryable() => {
                warn!(
                    epoch = request.epoch,
                    user = %request.user_key,
                    attempts,
                    error = %e,
                    "claim confirmation still pending after retries"
                );
                ClaimOutcome::Pending {
                    attempts,
                    last_error: e,
                }
            }
            e => {
                if e.class() == ErrorClass::Hard {
                    warn!(
                        epoch = request.epoch,
                        user = %request.user_key,
                        error = %e,
                        "claim confirmation failed hard"
                    );
                }
                ClaimOutcome::Failed { error: e }
            }
        },
    }
}

/// Batch confirmation: each epoch claim is fully independent. Partial
/// success (some confirmed, some pending, one hard-failed) is a valid
/// terminal outcome, reported per epoch; never all-or-nothing.
pub async fn confirm_batch(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
    requests: &[ClaimRequest],
    retry: &RetryConfig,
    now: u64,
) -> Vec<(u64, ClaimOutcome)> {
    let mut outcomes = Vec::with_capacity(requests.len());
    for request in requests {
        let outcome = confirm_claim_with_retry(db, gateway, request, retry, now).await;
        outcomes.push((request.epoch, outcome));
    }
    outcomes
}
