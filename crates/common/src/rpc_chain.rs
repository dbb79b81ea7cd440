//! HTTP client implementation of [`ChainGateway`].
//!
//! Talks to the settlement-chain RPC bridge over JSON. Transport and
//! decoding failures surface as retryable [`SettlementError::Chain`];
//! semantic outcomes (`tx_not_found`, `receipt_missing`, `tx_failed`)
//! are mapped onto the taxonomy so the coordinator never has to parse
//! strings.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::chain::{account_refs_for, AccountRefs, ChainGateway, ClaimEvidence, EpochRootAccount};
use crate::error::SettlementError;
use crate::hash::from_hex32;
use crate::types::UserKey;

/// Gateway backed by the chain RPC bridge.
pub struct RpcChainGateway {
    http: reqwest::Client,
    rpc_url: String,
    program_id: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::Deserialize<'de>"))]
struct RpcEnvelope<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct EpochRootPayload {
    epoch: u64,
    #[serde(rename = "rootHex")]
    root_hex: String,
}

#[derive(Debug, Deserialize)]
struct PublishPayload {
    #[serde(rename = "txSig")]
    tx_sig: String,
}

#[derive(Debug, Deserialize)]
struct EvidencePayload {
    epoch: u64,
    #[serde(rename = "userKeyHex")]
    user_key_hex: String,
    #[serde(rename = "claimedToHex")]
    claimed_to_hex: String,
    #[serde(rename = "amountAtomic")]
    amount_atomic: u64,
    index: u32,
    signature: String,
    #[serde(default)]
    err: Option<String>,
}

impl RpcChainGateway {
    #[must_use]
    pub fn new(
        rpc_url: impl Into<String>,
        program_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            program_id: program_id.into(),
            auth_token,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<RpcEnvelope<T>, SettlementError> {
        let url = format!("{}/{}", self.rpc_url.trim_end_matches('/'), method);
        let mut req = self.http.post(&url).json(&params);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        debug!(method, "chain rpc call");

        let response = req.send().await.map_err(|e| SettlementError::Chain {
            message: format!("{method}: {e}"),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SettlementError::Chain {
                message: format!("{method}: http {status}"),
            });
        }
        response.json().await.map_err(|e| SettlementError::Chain {
            message: format!("{method}: bad response: {e}"),
        })
    }
}

#[async_trait]
impl ChainGateway for RpcChainGateway {
    async fn set_epoch_root(&self, epoch: u64, root: [u8; 32]) -> Result<String, SettlementError> {
        let envelope: RpcEnvelope<PublishPayload> = self
            .call(
                "set-epoch-root",
                json!({ "epoch": epoch, "rootHex": hex::encode(root) }),
            )
            .await?;
        match (envelope.ok, envelope.result) {
            (true, Some(payload)) => Ok(payload.tx_sig),
            _ => Err(SettlementError::Chain {
                message: format!(
                    "set-epoch-root rejected: {}",
                    envelope.error.unwrap_or_else(|| "unknown".into())
                ),
            }),
        }
    }

    async fn epoch_root(&self, epoch: u64) -> Result<Option<EpochRootAccount>, SettlementError> {
        let envelope: RpcEnvelope<EpochRootPayload> = self
            .call("get-epoch-root", json!({ "epoch": epoch }))
            .await?;
        match envelope.result {
            None => Ok(None),
            Some(payload) => Ok(Some(EpochRootAccount {
                epoch: payload.epoch,
                root: from_hex32(&payload.root_hex)?,
            })),
        }
    }

    async fn claim_evidence(
        &self,
        epoch: u64,
        user_key: &UserKey,
        signature: &str,
    ) -> Result<ClaimEvidence, SettlementError> {
        let envelope: RpcEnvelope<EvidencePayload> = self
            .call(
                "get-claim-evidence",
                json!({
                    "epoch": epoch,
                    "userKeyHex": user_key.to_hex(),
                    "signature": signature,
                }),
            )
            .await?;

        // Semantic outcomes ride inside the envelope's error field.
        match envelope.error.as_deref() {
            Some("tx_not_found") => {
                return Err(SettlementError::TxNotFound {
                    signature: signature.to_string(),
                })
            }
            Some("receipt_missing") => {
                return Err(SettlementError::ReceiptMissing {
                    epoch,
                    user_key_hex: user_key.to_hex(),
                })
            }
            _ => {}
        }

        let payload = envelope.result.ok_or_else(|| SettlementError::Chain {
            message: "get-claim-evidence: empty result".into(),
        })?;
        if let Some(err) = payload.err {
            return Err(SettlementError::TxFailed {
                signature: payload.signature,
                reason: err,
            });
        }
        Ok(ClaimEvidence {
            epoch: payload.epoch,
            user_key: UserKey::from_hex(&payload.user_key_hex)?,
            claimed_to: UserKey::from_hex(&payload.claimed_to_hex)?,
            amount_atomic: payload.amount_atomic,
            index: payload.index,
            signature: payload.signature,
        })
    }

    fn account_refs(&self, epoch: u64, user_key: &UserKey) -> AccountRefs {
        account_refs_for(&self.program_id, epoch, user_key)
    }
}
