//! End-to-end settlement cycle tests: record → freeze → build →
//! publish → mark → claim → confirm, against the in-memory mock chain.

use std::sync::Arc;

use merx_common::{
    ClaimEvidence, EpochVersion, MockChain, RetryConfig, RewardEvent, RewardKind,
    SettlementError, UserKey, WeekKey,
};
use merx_coordinator::confirm::confirm_batch;
use merx_coordinator::{
    claimable_epochs, confirm_claim_with_retry, ClaimOutcome, ClaimRequest, ControlPlane,
};
use merx_ledger::record_event;
use merx_store::SettlementDb;

const WEEK: &str = "2026-01-19";

fn uk(byte: u8) -> UserKey {
    UserKey::from_bytes([byte; 32])
}

fn week(s: &str) -> WeekKey {
    WeekKey::parse(s).expect("week key")
}

/// Zero-delay schedule so retry tests run instantly.
fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay_ms: 0,
        max_delay_ms: 0,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: Arc<SettlementDb>,
    chain: Arc<MockChain>,
    control: ControlPlane,
}

fn setup(chain: MockChain) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(SettlementDb::open(dir.path()).expect("open db"));
    let chain = Arc::new(chain);
    let control = ControlPlane::new(db.clone(), chain.clone(), true);
    Harness {
        _dir: dir,
        db,
        chain,
        control,
    }
}

/// Record the canonical three-user week and run it to claimable state.
async fn run_cycle_to_marked(h: &Harness) -> u64 {
    for (user, amount) in [(1u8, 100u64), (2, 250), (3, 75)] {
        let ev = RewardEvent::new(uk(user), RewardKind::Rating, amount, week(WEEK), 10)
            .expect("event");
        record_event(&h.db, &ev).expect("record");
    }
    h.control.freeze(&week(WEEK), false, None, 50).expect("freeze");
    let built = h
        .control
        .build(&week(WEEK), EpochVersion::V2, None, 60)
        .await
        .expect("build");
    let epoch = built.epoch().epoch;
    let published = h.control.publish_root(epoch).await.expect("publish");
    h.control
        .mark_on_chain(epoch, Some(published.tx_sig))
        .await
        .expect("mark");
    epoch
}

fn claim_request(epoch: u64, user: UserKey, signature: &str) -> ClaimRequest {
    ClaimRequest {
        signature: signature.to_string(),
        epoch,
        user_key: user,
        claimer: user,
    }
}

// ── 1. FULL CYCLE: CLAIM, DOUBLE-CLAIM, CROSSED PROOF ───────────────────────

#[tokio::test]
async fn full_cycle_claim_and_double_claim() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;

    // User 2 claims with their own leaf and proof.
    let leaf = h
        .db
        .get_leaf(epoch, &uk(2))
        .expect("leaf query")
        .expect("leaf exists");
    assert_eq!(leaf.amount_atomic, 250_000);
    let signature = h.chain.execute_claim(&leaf, uk(2)).expect("on-chain claim");

    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(2), &signature),
        &fast_retry(3),
        100,
    )
    .await;
    let ClaimOutcome::Confirmed { receipt, .. } = outcome else {
        panic!("expected confirmation, got {outcome:?}");
    };
    assert_eq!(receipt.amount_atomic, 250_000);
    assert_eq!(receipt.tx_sig, signature);

    // Confirming the same claim again is idempotent.
    let again = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(2), &signature),
        &fast_retry(3),
        110,
    )
    .await;
    assert!(matches!(again, ClaimOutcome::AlreadyClaimed { receipt: Some(_) }));

    // User 2's leaf with user 3's proof fails verification on-chain.
    let other = h
        .db
        .get_leaf(epoch, &uk(3))
        .expect("leaf query")
        .expect("leaf exists");
    let mut crossed = leaf.clone();
    crossed.proof = other.proof;
    assert_eq!(
        h.chain.execute_claim(&crossed, uk(2)).expect_err("crossed"),
        SettlementError::BadProof { epoch }
    );
}

// ── 2. UNPUBLISHED EPOCH IS NOT CLAIMABLE ───────────────────────────────────

#[tokio::test]
async fn confirm_before_mark_is_refused() {
    let h = setup(MockChain::new("merx-test"));
    for (user, amount) in [(1u8, 100u64)] {
        let ev = RewardEvent::new(uk(user), RewardKind::Rating, amount, week(WEEK), 10)
            .expect("event");
        record_event(&h.db, &ev).expect("record");
    }
    h.control.freeze(&week(WEEK), false, None, 50).expect("freeze");
    let built = h
        .control
        .build(&week(WEEK), EpochVersion::V2, None, 60)
        .await
        .expect("build");

    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(built.epoch().epoch, uk(1), "sig"),
        &fast_retry(3),
        100,
    )
    .await;
    let ClaimOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.code(), "EPOCH_NOT_CLAIMABLE");
}

// ── 3. EVENTUAL CONSISTENCY: PENDING, THEN CONFIRMED ────────────────────────

#[tokio::test]
async fn visibility_delay_resolves_within_retries() {
    let h = setup(MockChain::new("merx-test").with_visibility_delay(2));
    let epoch = run_cycle_to_marked(&h).await;

    let leaf = h.db.get_leaf(epoch, &uk(1)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(1)).expect("claim");

    // Two lookups report not-visible; the third succeeds. One receipt.
    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(1), &signature),
        &fast_retry(5),
        100,
    )
    .await;
    let ClaimOutcome::Confirmed { attempts, .. } = outcome else {
        panic!("expected confirmation, got {outcome:?}");
    };
    assert_eq!(attempts, 3);
    assert!(h.db.get_receipt(epoch, &uk(1)).expect("query").is_some());
}

#[tokio::test]
async fn exhausted_retries_report_pending_then_succeed_later() {
    let h = setup(MockChain::new("merx-test").with_visibility_delay(10));
    let epoch = run_cycle_to_marked(&h).await;

    let leaf = h.db.get_leaf(epoch, &uk(1)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(1)).expect("claim");

    // Retries exhaust while the chain is still catching up → pending,
    // not failed, and no receipt row.
    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(1), &signature),
        &fast_retry(3),
        100,
    )
    .await;
    assert!(matches!(outcome, ClaimOutcome::Pending { attempts: 3, .. }));
    assert!(h.db.get_receipt(epoch, &uk(1)).expect("query").is_none());

    // A later confirmation (chain caught up) succeeds without creating
    // a duplicate receipt.
    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(1), &signature),
        &fast_retry(10),
        200,
    )
    .await;
    assert!(matches!(outcome, ClaimOutcome::Confirmed { .. }));
    assert_eq!(h.db.receipts_for_user(&uk(1)).expect("receipts").len(), 1);
}

// ── 4. CONCURRENT CONFIRMATIONS: EXACTLY ONE WINNER ─────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirms_settle_exactly_once() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;

    let leaf = h.db.get_leaf(epoch, &uk(2)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(2)).expect("claim");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = h.db.clone();
        let chain = h.chain.clone();
        let request = claim_request(epoch, uk(2), &signature);
        handles.push(tokio::spawn(async move {
            confirm_claim_with_retry(&db, chain.as_ref(), &request, &fast_retry(3), 100).await
        }));
    }

    let mut confirmed = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.expect("task") {
            ClaimOutcome::Confirmed { .. } => confirmed += 1,
            ClaimOutcome::AlreadyClaimed { .. } => already += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(already, 7);
    assert_eq!(h.db.receipts_for_user(&uk(2)).expect("receipts").len(), 1);
}

// ── 5. HARD FAILURES ARE NOT RETRIED AND LEAVE NO RECEIPT ───────────────────

#[tokio::test]
async fn mismatched_evidence_fails_hard() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;
    let leaf = h.db.get_leaf(epoch, &uk(1)).expect("query").expect("leaf");

    // Evidence claims a different amount than the leaf.
    h.chain.inject_evidence(ClaimEvidence {
        epoch,
        user_key: uk(1),
        claimed_to: uk(1),
        amount_atomic: leaf.amount_atomic + 1,
        index: leaf.index,
        signature: "forged".into(),
    });

    let outcome = confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(1), "forged"),
        &fast_retry(5),
        100,
    )
    .await;
    let ClaimOutcome::Failed { error } = outcome else {
        panic!("expected hard failure, got {outcome:?}");
    };
    assert_eq!(error.code(), "AMOUNT_MISMATCH");
    assert!(h.db.get_receipt(epoch, &uk(1)).expect("query").is_none());
}

#[tokio::test]
async fn wallet_mismatch_fails_hard() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;
    let leaf = h.db.get_leaf(epoch, &uk(1)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(1)).expect("claim");

    // Confirmation names a claimer that is not the wallet the tokens
    // actually went to.
    let mut request = claim_request(epoch, uk(1), &signature);
    request.claimer = uk(9);
    let outcome =
        confirm_claim_with_retry(&h.db, h.chain.as_ref(), &request, &fast_retry(3), 100).await;
    let ClaimOutcome::Failed { error } = outcome else {
        panic!("expected hard failure, got {outcome:?}");
    };
    assert_eq!(error.code(), "WALLET_MISMATCH");
}

// ── 6. BATCH CONFIRMATION IS PER-EPOCH ──────────────────────────────────────

#[tokio::test]
async fn batch_confirmation_reports_partial_success() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;

    // A second week → a second claimable epoch for user 1.
    for (user, amount) in [(1u8, 40u64)] {
        let ev = RewardEvent::new(uk(user), RewardKind::Vote, amount, week("2026-01-26"), 70)
            .expect("event");
        record_event(&h.db, &ev).expect("record");
    }
    h.control
        .freeze(&week("2026-01-26"), false, None, 80)
        .expect("freeze");
    let second = h
        .control
        .build(&week("2026-01-26"), EpochVersion::V2, None, 90)
        .await
        .expect("build")
        .epoch()
        .clone();
    let published = h.control.publish_root(second.epoch).await.expect("publish");
    h.control
        .mark_on_chain(second.epoch, Some(published.tx_sig))
        .await
        .expect("mark");

    // Claim only the first epoch on-chain; the second stays unexecuted.
    let leaf = h.db.get_leaf(epoch, &uk(1)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(1)).expect("claim");

    let requests = vec![
        claim_request(epoch, uk(1), &signature),
        claim_request(second.epoch, uk(1), "not-broadcast"),
    ];
    let outcomes = confirm_batch(
        &h.db,
        h.chain.as_ref(),
        &requests,
        &fast_retry(2),
        100,
    )
    .await;

    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0].1, ClaimOutcome::Confirmed { .. }));
    // The unexecuted claim is pending, not failed; and the confirmed
    // one is unaffected by it.
    assert!(matches!(outcomes[1].1, ClaimOutcome::Pending { .. }));
}

// ── 7. DISCOVERY ────────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_lists_then_clears_claimable_epochs() {
    let h = setup(MockChain::new("merx-test"));
    let epoch = run_cycle_to_marked(&h).await;

    let entries = claimable_epochs(&h.db, h.chain.as_ref(), &uk(2), Some(&uk(2)))
        .expect("discover");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.epoch, epoch);
    assert_eq!(entry.amount_atomic, 250_000);
    assert!(entry.salt_hex.is_some());
    assert!(!entry.wallet_mismatch);
    assert!(!entry.proof_hex.is_empty());

    // A user with a different linked wallet gets the mismatch flag.
    let flagged = claimable_epochs(&h.db, h.chain.as_ref(), &uk(2), Some(&uk(8)))
        .expect("discover");
    assert!(flagged[0].wallet_mismatch);

    // After settling, the epoch disappears from discovery.
    let leaf = h.db.get_leaf(epoch, &uk(2)).expect("query").expect("leaf");
    let signature = h.chain.execute_claim(&leaf, uk(2)).expect("claim");
    confirm_claim_with_retry(
        &h.db,
        h.chain.as_ref(),
        &claim_request(epoch, uk(2), &signature),
        &fast_retry(3),
        100,
    )
    .await;
    let entries = claimable_epochs(&h.db, h.chain.as_ref(), &uk(2), Some(&uk(2)))
        .expect("discover");
    assert!(entries.is_empty());

    // A user with no leaf sees nothing.
    let none = claimable_epochs(&h.db, h.chain.as_ref(), &uk(9), None).expect("discover");
    assert!(none.is_empty());
}
