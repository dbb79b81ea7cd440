//! # Settlement Chain Gateway
//!
//! Abstraction over the external blockchain the engine publishes roots
//! to and confirms claims against. The engine never constructs or signs
//! transactions itself (that is the gateway implementation's concern),
//! but it owns the contract around confirmation:
//!
//! - `set_epoch_root` resolves only once the publishing transaction is
//!   itself confirmed; the caller may then (and only then) mark the
//!   epoch on-chain.
//! - `claim_evidence` distinguishes *not visible yet* (transient
//!   [`SettlementError::TxNotFound`] / [`SettlementError::ReceiptMissing`])
//!   from *executed and wrong* (hard failures). The chain is eventually
//!   consistent; the distinction is what makes bounded retry sound.

use async_trait::async_trait;

use crate::error::SettlementError;
use crate::hash::{hex32, keccak_hashv};
use crate::types::UserKey;

// ════════════════════════════════════════════════════════════════════════════
// GATEWAY DATA
// ════════════════════════════════════════════════════════════════════════════

/// The on-chain epoch root account, as read back from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRootAccount {
    pub epoch: u64,
    pub root: [u8; 32],
}

/// What the chain records when a claim instruction executes: the
/// receipt account's contents plus the transaction that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEvidence {
    pub epoch: u64,
    /// Identity the claim was keyed by.
    pub user_key: UserKey,
    /// Wallet the tokens were transferred to.
    pub claimed_to: UserKey,
    pub amount_atomic: u64,
    pub index: u32,
    pub signature: String,
}

/// Derived on-chain account references a wallet needs to submit the
/// claim instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRefs {
    pub epoch_root: String,
    pub receipt: String,
    pub vault_authority: String,
}

/// Deterministic account-reference derivation from program id + seeds.
///
/// Stand-in for the chain's native program-derived addressing: the same
/// (program, seeds) always yields the same reference, which is all the
/// discovery API needs to hand a wallet.
#[must_use]
pub fn derive_account_ref(program_id: &str, seeds: &[&[u8]]) -> String {
    let mut parts: Vec<&[u8]> = vec![program_id.as_bytes()];
    parts.extend_from_slice(seeds);
    hex32(&keccak_hashv(&parts))
}

/// References for one (epoch, user) claim, derived the way the on-chain
/// program derives its accounts.
#[must_use]
pub fn account_refs_for(program_id: &str, epoch: u64, user_key: &UserKey) -> AccountRefs {
    let epoch_le = epoch.to_le_bytes();
    AccountRefs {
        epoch_root: derive_account_ref(program_id, &[b"epoch_root", &epoch_le]),
        receipt: derive_account_ref(program_id, &[b"receipt_v2", &epoch_le, user_key.as_bytes()]),
        vault_authority: derive_account_ref(program_id, &[b"vault_authority"]),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// GATEWAY TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Contract every settlement-chain backend implements.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Publish an epoch root. Resolves with the transaction signature
    /// only after the transaction is confirmed by the chain. Publishing
    /// a *different* root for an epoch that already has one is an error
    /// (the root account is init-once).
    async fn set_epoch_root(&self, epoch: u64, root: [u8; 32]) -> Result<String, SettlementError>;

    /// Read the epoch root account, `None` if it does not exist.
    async fn epoch_root(&self, epoch: u64) -> Result<Option<EpochRootAccount>, SettlementError>;

    /// Look up the evidence that a claim executed.
    ///
    /// Errors: [`SettlementError::TxNotFound`] /
    /// [`SettlementError::ReceiptMissing`] while the chain has not made
    /// the result visible (retryable); [`SettlementError::TxFailed`]
    /// when the transaction executed and failed (hard).
    async fn claim_evidence(
        &self,
        epoch: u64,
        user_key: &UserKey,
        signature: &str,
    ) -> Result<ClaimEvidence, SettlementError>;

    /// Account references for one (epoch, user) claim.
    fn account_refs(&self, epoch: u64, user_key: &UserKey) -> AccountRefs;
}
