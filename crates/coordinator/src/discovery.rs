//! # Claim Discovery
//!
//! Per wallet: which epochs are committed on-chain and still unclaimed,
//! each with everything a wallet needs to submit the claim instruction
//!; amount, index, salt, proof and the derived account references.

use serde::Serialize;

use merx_common::{AccountRefs, ChainGateway, EpochVersion, SettlementError, UserKey, WeekKey};
use merx_store::SettlementDb;

/// One claimable epoch for a user.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimableEntry {
    pub epoch: u64,
    #[serde(rename = "weekKey")]
    pub week_key: WeekKey,
    pub version: u8,
    #[serde(rename = "rootHex")]
    pub root_hex: String,
    pub index: u32,
    #[serde(rename = "amountAtomic")]
    pub amount_atomic: u64,
    #[serde(rename = "userKeyHex")]
    pub user_key_hex: String,
    #[serde(rename = "claimSaltHex")]
    pub salt_hex: Option<String>,
    #[serde(rename = "proofHex")]
    pub proof_hex: Vec<String>,
    #[serde(rename = "epochRootRef")]
    pub epoch_root_ref: String,
    #[serde(rename = "receiptRef")]
    pub receipt_ref: String,
    #[serde(rename = "vaultAuthorityRef")]
    pub vault_authority_ref: String,
    /// The linked wallet does not match the leaf's user key. The claim
    /// must be made with the wallet that earned the rewards; surfacing
    /// this here spares the user a doomed transaction.
    #[serde(rename = "walletMismatch")]
    pub wallet_mismatch: bool,
}

/// Epochs with `set_on_chain = true` and no receipt for this user.
pub fn claimable_epochs(
    db: &SettlementDb,
    gateway: &dyn ChainGateway,
    user_key: &UserKey,
    linked_wallet: Option<&UserKey>,
) -> Result<Vec<ClaimableEntry>, SettlementError> {
    let mut entries = Vec::new();

    for epoch in db.published_epochs()? {
        let Some(leaf) = db.get_leaf(epoch.epoch, user_key)? else {
            continue;
        };
        if db.get_receipt(epoch.epoch, user_key)?.is_some() {
            continue;
        }

        let AccountRefs {
            epoch_root,
            receipt,
            vault_authority,
        } = gateway.account_refs(epoch.epoch, user_key);

        // V2 identity is the wallet itself: a linked wallet that is not
        // the leaf's user key cannot sign a passing claim.
        let wallet_mismatch = match (epoch.version, linked_wallet) {
            (EpochVersion::V2, Some(wallet)) => wallet != user_key,
            _ => false,
        };

        entries.push(ClaimableEntry {
            epoch: epoch.epoch,
            week_key: epoch.week_key.clone(),
            version: epoch.version.as_u8(),
            root_hex: epoch.root_hex(),
            index: leaf.index,
            amount_atomic: leaf.amount_atomic,
            user_key_hex: user_key.to_hex(),
            salt_hex: leaf.salt.map(hex::encode),
            proof_hex: leaf.proof.iter().map(hex::encode).collect(),
            epoch_root_ref: epoch_root,
            receipt_ref: receipt,
            vault_authority_ref: vault_authority,
            wallet_mismatch,
        });
    }

    Ok(entries)
}
