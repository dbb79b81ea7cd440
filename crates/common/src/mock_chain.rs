//! Mock settlement chain for tests.
//!
//! Fully in-memory, no network. The mock executes claim instructions
//! the way the on-chain program does (recompute the leaf, verify the
//! proof against the published root, refuse a second receipt), so the
//! builder and the "chain" verify with the identical code path.
//!
//! Eventual consistency is simulated with a visibility delay: evidence
//! exists the moment a claim executes, but `claim_evidence` reports
//! `TX_NOT_FOUND` for the first N lookups.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::chain::{account_refs_for, AccountRefs, ChainGateway, ClaimEvidence, EpochRootAccount};
use crate::error::SettlementError;
use crate::hash::{hex32, keccak_hashv};
use crate::merkle::{leaf_hash_v1, leaf_hash_v2, verify_proof};
use crate::types::{ClaimLeaf, UserKey};

#[derive(Default)]
struct MockState {
    /// epoch → (root, publish tx signature)
    roots: HashMap<u64, ([u8; 32], String)>,
    /// (epoch, user) → executed claim evidence
    evidence: HashMap<(u64, UserKey), ClaimEvidence>,
    /// (epoch, user) → how many times evidence has been looked up
    lookups: HashMap<(u64, UserKey), u32>,
    /// signature → failure reason, for executed-and-failed transactions
    failed_txs: HashMap<String, String>,
    /// fail the next N publish calls with a chain error
    publish_failures: u32,
    tx_counter: u64,
}

/// In-memory [`ChainGateway`] with deterministic behaviour.
pub struct MockChain {
    program_id: String,
    latency_ms: u64,
    /// Evidence lookups required before a claim becomes visible.
    visibility_delay: u32,
    state: RwLock<MockState>,
}

impl std::fmt::Debug for MockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MockChain")
            .field("roots", &state.roots.len())
            .field("evidence", &state.evidence.len())
            .field("visibility_delay", &self.visibility_delay)
            .finish()
    }
}

impl MockChain {
    #[must_use]
    pub fn new(program_id: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            latency_ms: 0,
            visibility_delay: 0,
            state: RwLock::new(MockState::default()),
        }
    }

    /// Simulated per-call latency.
    #[must_use]
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Require `n` evidence lookups before a claim becomes visible.
    #[must_use]
    pub fn with_visibility_delay(mut self, n: u32) -> Self {
        self.visibility_delay = n;
        self
    }

    /// Fail the next `n` `set_epoch_root` calls with a chain error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.write().publish_failures = n;
    }

    /// Test helper: place arbitrary evidence directly (e.g. a mismatched
    /// amount for hard-failure tests).
    pub fn inject_evidence(&self, evidence: ClaimEvidence) {
        let key = (evidence.epoch, evidence.user_key);
        self.state.write().evidence.insert(key, evidence);
    }

    /// Test helper: register an executed-and-failed transaction.
    pub fn fail_tx(&self, signature: impl Into<String>, reason: impl Into<String>) {
        self.state
            .write()
            .failed_txs
            .insert(signature.into(), reason.into());
    }

    /// Execute a claim instruction the way the on-chain program would:
    /// verify the proof against the published root, refuse a second
    /// receipt, record evidence, return the transaction signature.
    pub fn execute_claim(
        &self,
        leaf: &ClaimLeaf,
        claimer: UserKey,
    ) -> Result<String, SettlementError> {
        let mut state = self.state.write();

        let root = state
            .roots
            .get(&leaf.epoch)
            .map(|(root, _)| *root)
            .ok_or(SettlementError::EpochRootNotSet { epoch: leaf.epoch })?;

        let leaf_hash = match leaf.salt {
            Some(salt) => leaf_hash_v2(
                &leaf.user_key,
                leaf.epoch,
                leaf.amount_atomic,
                leaf.index,
                &salt,
            ),
            None => leaf_hash_v1(&leaf.user_key, leaf.epoch, leaf.amount_atomic, leaf.index),
        };
        if !verify_proof(leaf_hash, &leaf.proof, &root) {
            return Err(SettlementError::BadProof { epoch: leaf.epoch });
        }

        let key = (leaf.epoch, leaf.user_key);
        if state.evidence.contains_key(&key) {
            // Receipt account init happens once; a second claim fails.
            return Err(SettlementError::TxFailed {
                signature: String::new(),
                reason: "receipt account already initialized".into(),
            });
        }

        state.tx_counter += 1;
        let signature = hex32(&keccak_hashv(&[
            b"claim-tx",
            &leaf.epoch.to_le_bytes(),
            leaf.user_key.as_bytes(),
            &state.tx_counter.to_le_bytes(),
        ]));

        state.evidence.insert(
            key,
            ClaimEvidence {
                epoch: leaf.epoch,
                user_key: leaf.user_key,
                claimed_to: claimer,
                amount_atomic: leaf.amount_atomic,
                index: leaf.index,
                signature: signature.clone(),
            },
        );
        state.lookups.insert(key, 0);
        debug!(epoch = leaf.epoch, user = %leaf.user_key, "mock claim executed");
        Ok(signature)
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    async fn set_epoch_root(&self, epoch: u64, root: [u8; 32]) -> Result<String, SettlementError> {
        self.simulate_latency().await;
        let mut state = self.state.write();

        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(SettlementError::Chain {
                message: "rpc connection reset".into(),
            });
        }

        if let Some((existing_root, existing_sig)) = state.roots.get(&epoch) {
            if *existing_root == root {
                // Re-publishing the same root is a no-op.
                return Ok(existing_sig.clone());
            }
            return Err(SettlementError::Chain {
                message: format!("epoch root account for {epoch} already initialized"),
            });
        }

        state.tx_counter += 1;
        let signature = hex32(&keccak_hashv(&[
            b"root-tx",
            &epoch.to_le_bytes(),
            &root,
            &state.tx_counter.to_le_bytes(),
        ]));
        state.roots.insert(epoch, (root, signature.clone()));
        Ok(signature)
    }

    async fn epoch_root(&self, epoch: u64) -> Result<Option<EpochRootAccount>, SettlementError> {
        self.simulate_latency().await;
        let state = self.state.read();
        Ok(state
            .roots
            .get(&epoch)
            .map(|(root, _)| EpochRootAccount { epoch, root: *root }))
    }

    async fn claim_evidence(
        &self,
        epoch: u64,
        user_key: &UserKey,
        signature: &str,
    ) -> Result<ClaimEvidence, SettlementError> {
        self.simulate_latency().await;
        let mut state = self.state.write();

        if let Some(reason) = state.failed_txs.get(signature) {
            return Err(SettlementError::TxFailed {
                signature: signature.to_string(),
                reason: reason.clone(),
            });
        }

        let key = (epoch, *user_key);
        match state.evidence.get(&key).cloned() {
            None => Err(SettlementError::TxNotFound {
                signature: signature.to_string(),
            }),
            Some(evidence) => {
                let seen = state.lookups.entry(key).or_insert(0);
                if *seen < self.visibility_delay {
                    *seen += 1;
                    // Executed, but this confirmation path cannot see it yet.
                    return Err(SettlementError::ReceiptMissing {
                        epoch,
                        user_key_hex: user_key.to_hex(),
                    });
                }
                Ok(evidence)
            }
        }
    }

    fn account_refs(&self, epoch: u64, user_key: &UserKey) -> AccountRefs {
        account_refs_for(&self.program_id, epoch, user_key)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::parent_hash;

    fn uk(byte: u8) -> UserKey {
        UserKey::from_bytes([byte; 32])
    }

    /// Two-leaf epoch built by hand with the shared primitives.
    fn two_leaf_fixture(epoch: u64) -> (ClaimLeaf, ClaimLeaf, [u8; 32]) {
        let l0_hash = leaf_hash_v1(&uk(1), epoch, 100, 0);
        let l1_hash = leaf_hash_v1(&uk(2), epoch, 250, 1);
        let root = parent_hash(&l0_hash, &l1_hash);
        let leaf0 = ClaimLeaf {
            epoch,
            user_key: uk(1),
            amount_atomic: 100,
            index: 0,
            salt: None,
            proof: vec![l1_hash],
        };
        let leaf1 = ClaimLeaf {
            epoch,
            user_key: uk(2),
            amount_atomic: 250,
            index: 1,
            salt: None,
            proof: vec![l0_hash],
        };
        (leaf0, leaf1, root)
    }

    // ── 1. ROOT PUBLISH IS INIT-ONCE ────────────────────────────────────

    #[tokio::test]
    async fn set_epoch_root_is_init_once() {
        let chain = MockChain::new("test-program");
        let sig1 = chain.set_epoch_root(1, [0xAA; 32]).await.expect("publish");
        // Same root → same signature, no error.
        let sig2 = chain.set_epoch_root(1, [0xAA; 32]).await.expect("idempotent");
        assert_eq!(sig1, sig2);
        // Different root → refused.
        assert!(chain.set_epoch_root(1, [0xBB; 32]).await.is_err());
    }

    // ── 2. CLAIM EXECUTION VERIFIES PROOFS ──────────────────────────────

    #[tokio::test]
    async fn execute_claim_rejects_bad_proof() {
        let chain = MockChain::new("test-program");
        let (leaf0, leaf1, root) = two_leaf_fixture(3);
        chain.set_epoch_root(3, root).await.expect("publish");

        // Leaf 0 with leaf 1's proof cannot verify.
        let mut crossed = leaf0.clone();
        crossed.proof = leaf1.proof.clone();
        assert_eq!(
            chain.execute_claim(&crossed, uk(1)).expect_err("bad proof"),
            SettlementError::BadProof { epoch: 3 }
        );

        // The genuine proof executes.
        chain.execute_claim(&leaf0, uk(1)).expect("good proof");
    }

    #[tokio::test]
    async fn execute_claim_refuses_second_receipt() {
        let chain = MockChain::new("test-program");
        let (leaf0, _, root) = two_leaf_fixture(4);
        chain.set_epoch_root(4, root).await.expect("publish");

        chain.execute_claim(&leaf0, uk(1)).expect("first");
        let err = chain.execute_claim(&leaf0, uk(1)).expect_err("second");
        assert_eq!(err.code(), "TX_FAILED");
    }

    // ── 3. VISIBILITY DELAY ─────────────────────────────────────────────

    #[tokio::test]
    async fn evidence_becomes_visible_after_delay() {
        let chain = MockChain::new("test-program").with_visibility_delay(2);
        let (leaf0, _, root) = two_leaf_fixture(5);
        chain.set_epoch_root(5, root).await.expect("publish");
        let sig = chain.execute_claim(&leaf0, uk(1)).expect("claim");

        let user = uk(1);
        for _ in 0..2 {
            let err = chain.claim_evidence(5, &user, &sig).await.expect_err("hidden");
            assert!(err.is_retryable());
        }
        let evidence = chain.claim_evidence(5, &user, &sig).await.expect("visible");
        assert_eq!(evidence.amount_atomic, 100);
        assert_eq!(evidence.signature, sig);
    }

    #[tokio::test]
    async fn unknown_claim_is_tx_not_found() {
        let chain = MockChain::new("test-program");
        let err = chain
            .claim_evidence(9, &uk(9), "nosuchsig")
            .await
            .expect_err("unknown");
        assert_eq!(err.code(), "TX_NOT_FOUND");
        assert!(err.is_retryable());
    }
}
