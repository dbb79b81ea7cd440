//! # Admin Control Plane
//!
//! Operator-triggered state transitions for the weekly cycle: freeze,
//! build, publish, mark-on-chain, and the development-only week reset.
//! Every operation is idempotent or explicitly guarded; nothing here
//! executes partially.
//!
//! Publication is deliberately two steps. `publish_root` submits the
//! transaction and returns its signature; `mark_on_chain` independently
//! reads the root account back from the chain, compares it against the
//! store, and only then flips the one-way flag. A rebuilt-after-publish
//! epoch can therefore never be marked claimable.

use std::sync::Arc;

use tracing::{info, warn};

use merx_common::{ChainGateway, ClaimEpoch, EpochVersion, SettlementError, WeekKey};
use merx_epoch::{build_epoch, BuildOutcome, BuildRequest};
use merx_ledger::{freeze_batch, FreezeOptions, FreezeOutcome};
use merx_store::{ResetCounts, SettlementDb};

/// Result of `publish_root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub epoch: u64,
    pub tx_sig: String,
    /// The epoch was already marked on-chain; nothing was submitted.
    pub already_published: bool,
}

/// Result of `mark_on_chain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    pub epoch: ClaimEpoch,
    /// The flag was already set; the recorded tx_sig was kept.
    pub already_set: bool,
}

/// The guarded operator surface.
pub struct ControlPlane {
    db: Arc<SettlementDb>,
    gateway: Arc<dyn ChainGateway>,
    /// Gate for the destructive week reset (development only).
    allow_reset: bool,
}

impl ControlPlane {
    #[must_use]
    pub fn new(db: Arc<SettlementDb>, gateway: Arc<dyn ChainGateway>, allow_reset: bool) -> Self {
        Self {
            db,
            gateway,
            allow_reset,
        }
    }

    /// Freeze the weekly batch. See [`merx_ledger::freeze_batch`].
    pub fn freeze(
        &self,
        week_key: &WeekKey,
        force: bool,
        source_week: Option<WeekKey>,
        now: u64,
    ) -> Result<FreezeOutcome, SettlementError> {
        freeze_batch(
            &self.db,
            week_key,
            FreezeOptions { force, source_week },
            now,
        )
    }

    /// Build (or idempotently skip) the epoch for a week.
    pub async fn build(
        &self,
        week_key: &WeekKey,
        version: EpochVersion,
        generation: Option<u32>,
        now: u64,
    ) -> Result<BuildOutcome, SettlementError> {
        build_epoch(
            &self.db,
            self.gateway.as_ref(),
            &BuildRequest {
                week_key: week_key.clone(),
                version,
                generation,
            },
            now,
        )
        .await
    }

    /// Submit the epoch root to the chain. Resolves once the publishing
    /// transaction is confirmed; does NOT mark the epoch on-chain.
    pub async fn publish_root(&self, epoch_number: u64) -> Result<PublishOutcome, SettlementError> {
        let epoch = self
            .db
            .get_epoch(epoch_number)?
            .ok_or(SettlementError::EpochNotFound {
                epoch: epoch_number,
            })?;

        if epoch.set_on_chain {
            return Ok(PublishOutcome {
                epoch: epoch_number,
                tx_sig: epoch.on_chain_tx_sig.unwrap_or_default(),
                already_published: true,
            });
        }

        let tx_sig = self.gateway.set_epoch_root(epoch_number, epoch.root).await?;
        info!(epoch = epoch_number, tx = %tx_sig, "epoch root published");
        Ok(PublishOutcome {
            epoch: epoch_number,
            tx_sig,
            already_published: false,
        })
    }

    /// Verify the on-chain root against the store and flip the one-way
    /// flag. Idempotent: a second call is a no-op that keeps the
    /// originally recorded tx_sig.
    pub async fn mark_on_chain(
        &self,
        epoch_number: u64,
        tx_sig: Option<String>,
    ) -> Result<MarkOutcome, SettlementError> {
        let epoch = self
            .db
            .get_epoch(epoch_number)?
            .ok_or(SettlementError::EpochNotFound {
                epoch: epoch_number,
            })?;

        if epoch.set_on_chain {
            return Ok(MarkOutcome {
                epoch,
                already_set: true,
            });
        }

        let on_chain = self
            .gateway
            .epoch_root(epoch_number)
            .await?
            .ok_or(SettlementError::EpochRootNotSet {
                epoch: epoch_number,
            })?;

        if on_chain.root != epoch.root {
            warn!(
                epoch = epoch_number,
                store = %epoch.root_hex(),
                chain = %hex::encode(on_chain.root),
                "refusing to mark epoch: on-chain root differs from store"
            );
            return Err(SettlementError::RootMismatch {
                epoch: epoch_number,
                expected_hex: epoch.root_hex(),
                on_chain_hex: hex::encode(on_chain.root),
            });
        }

        let marked = self.db.mark_on_chain(epoch_number, tx_sig)?;
        info!(epoch = epoch_number, "epoch marked on-chain");
        Ok(MarkOutcome {
            epoch: marked,
            already_set: false,
        })
    }

    /// Latest epoch in the store, queried fresh on every call. Concurrent
    /// operators never see a cached singleton.
    pub fn latest_epoch(&self) -> Result<Option<ClaimEpoch>, SettlementError> {
        Ok(self.db.latest_epoch()?)
    }

    /// Epochs built but not yet committed on-chain.
    pub fn unpublished(&self) -> Result<Vec<ClaimEpoch>, SettlementError> {
        Ok(self.db.unpublished_epochs()?)
    }

    /// Development-only destructive reset of a week. Refused when the
    /// environment does not allow it, and refused by the store when any
    /// implicated epoch is on-chain.
    pub fn reset_week(&self, week_key: &WeekKey) -> Result<ResetCounts, SettlementError> {
        if !self.allow_reset {
            return Err(SettlementError::ResetForbidden {
                week_key: week_key.to_string(),
                reason: "reset is disabled in this environment".into(),
            });
        }
        self.db.delete_week(week_key)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use merx_common::{MockChain, RewardEvent, RewardKind, UserKey};
    use merx_ledger::record_event;

    fn uk(byte: u8) -> UserKey {
        UserKey::from_bytes([byte; 32])
    }

    fn week(s: &str) -> WeekKey {
        WeekKey::parse(s).expect("week key")
    }

    fn setup(allow_reset: bool) -> (tempfile::TempDir, Arc<MockChain>, ControlPlane) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(SettlementDb::open(dir.path()).expect("open"));
        let chain = Arc::new(MockChain::new("test-program"));
        let control = ControlPlane::new(db, chain.clone(), allow_reset);
        (dir, chain, control)
    }

    fn seed(control: &ControlPlane, week_key: &str) {
        for (user, amount) in [(1u8, 100u64), (2, 250), (3, 75)] {
            let ev = RewardEvent::new(uk(user), RewardKind::Rating, amount, week(week_key), 10)
                .expect("event");
            record_event(&control.db, &ev).expect("record");
        }
    }

    async fn freeze_and_build(control: &ControlPlane, week_key: &str) -> ClaimEpoch {
        seed(control, week_key);
        control
            .freeze(&week(week_key), false, None, 50)
            .expect("freeze");
        control
            .build(&week(week_key), EpochVersion::V2, None, 60)
            .await
            .expect("build")
            .epoch()
            .clone()
    }

    // ── 1. PUBLISH THEN MARK ────────────────────────────────────────────

    #[tokio::test]
    async fn publish_then_mark_happy_path() {
        let (_dir, _chain, control) = setup(false);
        let epoch = freeze_and_build(&control, "2026-01-19").await;

        let published = control.publish_root(epoch.epoch).await.expect("publish");
        assert!(!published.already_published);
        assert!(!published.tx_sig.is_empty());

        let marked = control
            .mark_on_chain(epoch.epoch, Some(published.tx_sig.clone()))
            .await
            .expect("mark");
        assert!(!marked.already_set);
        assert!(marked.epoch.set_on_chain);
        assert_eq!(marked.epoch.on_chain_tx_sig, Some(published.tx_sig));
    }

    // ── 2. MARK WITHOUT PUBLISH IS REFUSED ──────────────────────────────

    #[tokio::test]
    async fn mark_without_publish_is_refused() {
        let (_dir, _chain, control) = setup(false);
        let epoch = freeze_and_build(&control, "2026-01-19").await;

        let err = control
            .mark_on_chain(epoch.epoch, None)
            .await
            .expect_err("no root on-chain");
        assert_eq!(err.code(), "EPOCH_ROOT_NOT_SET");
    }

    // ── 3. ROOT MISMATCH IS REFUSED ─────────────────────────────────────

    #[tokio::test]
    async fn mark_with_mismatched_root_is_refused() {
        let (_dir, chain, control) = setup(false);
        let epoch = freeze_and_build(&control, "2026-01-19").await;

        // A different root lands on-chain for this epoch number.
        chain
            .set_epoch_root(epoch.epoch, [0xEE; 32])
            .await
            .expect("foreign root");

        let err = control
            .mark_on_chain(epoch.epoch, None)
            .await
            .expect_err("mismatch");
        assert_eq!(err.code(), "ROOT_MISMATCH");

        // The flag stayed down.
        let stored = control.db.get_epoch(epoch.epoch).expect("get").expect("some");
        assert!(!stored.set_on_chain);
    }

    // ── 4. MARK IS IDEMPOTENT ───────────────────────────────────────────

    #[tokio::test]
    async fn second_mark_is_a_no_op() {
        let (_dir, _chain, control) = setup(false);
        let epoch = freeze_and_build(&control, "2026-01-19").await;
        let published = control.publish_root(epoch.epoch).await.expect("publish");
        control
            .mark_on_chain(epoch.epoch, Some(published.tx_sig.clone()))
            .await
            .expect("first mark");

        let again = control
            .mark_on_chain(epoch.epoch, Some("other-sig".into()))
            .await
            .expect("second mark");
        assert!(again.already_set);
        assert_eq!(again.epoch.on_chain_tx_sig, Some(published.tx_sig));
    }

    // ── 5. PUBLISH AFTER MARK SHORT-CIRCUITS ────────────────────────────

    #[tokio::test]
    async fn publish_after_mark_reports_already_published() {
        let (_dir, _chain, control) = setup(false);
        let epoch = freeze_and_build(&control, "2026-01-19").await;
        let first = control.publish_root(epoch.epoch).await.expect("publish");
        control
            .mark_on_chain(epoch.epoch, Some(first.tx_sig.clone()))
            .await
            .expect("mark");

        let second = control.publish_root(epoch.epoch).await.expect("re-publish");
        assert!(second.already_published);
        assert_eq!(second.tx_sig, first.tx_sig);
    }

    // ── 6. RESET GATING ─────────────────────────────────────────────────

    #[tokio::test]
    async fn reset_requires_environment_gate() {
        let (_dir, _chain, control) = setup(false);
        let err = control
            .reset_week(&week("2026-01-19"))
            .expect_err("disabled");
        assert_eq!(err.code(), "RESET_FORBIDDEN");
    }

    #[tokio::test]
    async fn reset_refuses_on_chain_week_even_when_enabled() {
        let (_dir, _chain, control) = setup(true);
        let epoch = freeze_and_build(&control, "2026-01-19").await;
        control.publish_root(epoch.epoch).await.expect("publish");
        control
            .mark_on_chain(epoch.epoch, None)
            .await
            .expect("mark");

        let err = control
            .reset_week(&week("2026-01-19"))
            .expect_err("on-chain");
        assert_eq!(err.code(), "RESET_FORBIDDEN");
        assert!(control.db.get_epoch(epoch.epoch).expect("get").is_some());
    }

    #[tokio::test]
    async fn reset_deletes_prepublication_week() {
        let (_dir, _chain, control) = setup(true);
        let epoch = freeze_and_build(&control, "2026-01-19").await;

        let counts = control.reset_week(&week("2026-01-19")).expect("reset");
        assert_eq!(counts.epochs, 1);
        assert_eq!(counts.events, 3);
        assert!(control.db.get_epoch(epoch.epoch).expect("get").is_none());
    }

    // ── 7. LATEST EPOCH IS A LIVE QUERY ─────────────────────────────────

    #[tokio::test]
    async fn latest_epoch_reflects_new_builds() {
        let (_dir, _chain, control) = setup(false);
        assert!(control.latest_epoch().expect("empty").is_none());

        let epoch = freeze_and_build(&control, "2026-01-19").await;
        assert_eq!(
            control.latest_epoch().expect("some").expect("epoch").epoch,
            epoch.epoch
        );

        let unpublished = control.unpublished().expect("unpublished");
        assert_eq!(unpublished.len(), 1);
    }
}
