//! Event recording and weekly batch freezing.
//!
//! `freeze_batch` follows the mutation-gate discipline: every check runs
//! read-only first, and the batch row + event attachment writes happen
//! only after all of them pass. A failed freeze mutates nothing.

use std::collections::BTreeMap;

use tracing::{info, warn};

use merx_common::{
    BatchStatus, RewardBatch, RewardEvent, SettlementError, WeekKey,
};
use merx_store::SettlementDb;

/// How a freeze run is parameterized.
#[derive(Debug, Clone, Default)]
pub struct FreezeOptions {
    /// Rerun the freeze even though a FROZEN batch exists. Creates a new
    /// batch *generation*; history is never mutated, and paying the
    /// same stats twice is an explicit, logged risk of this flag.
    pub force: bool,
    /// Makeup payout: aggregate the stats of this week instead of the
    /// payout week. Lets an operator recover a missed cycle without
    /// corrupting the canonical weekly timeline.
    pub source_week: Option<WeekKey>,
}

/// Result of a successful freeze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeOutcome {
    pub week_key: WeekKey,
    pub generation: u32,
    pub user_count: usize,
    pub event_count: u64,
    /// 6-decimal ledger units.
    pub total_amount: u64,
}

/// Append one reward event.
///
/// Safe to call from many producers at once: one short write
/// transaction per event, no ledger-wide lock in this process.
pub fn record_event(db: &SettlementDb, event: &RewardEvent) -> Result<(), SettlementError> {
    db.put_event(event)?;
    Ok(())
}

/// Freeze the weekly batch for `week_key`.
///
/// - A FROZEN batch already exists and `force` is off → `BATCH_EXISTS`
///   (a no-op the caller should not blindly retry).
/// - Makeup payouts are refused once the payout week has an on-chain
///   epoch (`PAYOUT_WEEK_ON_CHAIN`); those payouts already happened.
/// - No aggregatable events → `NO_PAID_REWARDS`.
pub fn freeze_batch(
    db: &SettlementDb,
    week_key: &WeekKey,
    opts: FreezeOptions,
    now: u64,
) -> Result<FreezeOutcome, SettlementError> {
    // ── read-only validation ────────────────────────────────────────────
    let existing_generation = db.latest_batch_generation(week_key)?;
    if existing_generation.is_some() && !opts.force {
        return Err(SettlementError::BatchExists {
            week_key: week_key.to_string(),
        });
    }

    let source_week = opts.source_week.clone().unwrap_or_else(|| week_key.clone());
    let is_makeup = source_week != *week_key;

    if is_makeup {
        // A makeup run must not overwrite a payout week that already
        // settled on-chain.
        if let Some(on_chain) = db
            .epochs_for_week(week_key)?
            .iter()
            .find(|e| e.set_on_chain)
        {
            return Err(SettlementError::PayoutWeekOnChain {
                week_key: week_key.to_string(),
                epoch: on_chain.epoch,
            });
        }
    }

    let generation = existing_generation.map_or(0, |g| g + 1);
    if generation > 0 {
        warn!(
            week = %week_key,
            generation,
            "forced freeze rerun: a new batch generation will duplicate reward rows"
        );
    }

    let events = db.events_for_source_week(&source_week)?;
    // A forced rerun re-aggregates everything for the stats week; the
    // first freeze only consumes events no generation has claimed yet.
    let eligible: Vec<&RewardEvent> = events
        .iter()
        .filter(|e| opts.force || e.batch_generation.is_none())
        .collect();

    if eligible.is_empty() {
        return Err(SettlementError::NoPaidRewards {
            week_key: source_week.to_string(),
        });
    }

    let mut totals: BTreeMap<_, u64> = BTreeMap::new();
    let mut total_amount: u64 = 0;
    for event in &eligible {
        let entry = totals.entry(event.user_key).or_insert(0);
        *entry = entry.saturating_add(event.amount);
        total_amount = total_amount.saturating_add(event.amount);
    }

    // ── mutation ────────────────────────────────────────────────────────
    let batch = RewardBatch {
        week_key: week_key.clone(),
        generation,
        status: BatchStatus::Frozen,
        source_week_key: source_week.clone(),
        totals_by_user: totals,
        total_amount,
        event_count: eligible.len() as u64,
        created_at: now,
    };
    db.put_batch(&batch)?;

    let ids: Vec<_> = eligible.iter().map(|e| e.id).collect();
    db.mark_events_attached(&ids, generation)?;

    info!(
        week = %week_key,
        source = %source_week,
        generation,
        users = batch.totals_by_user.len(),
        events = batch.event_count,
        total = batch.total_amount,
        "batch frozen"
    );

    Ok(FreezeOutcome {
        week_key: week_key.clone(),
        generation,
        user_count: batch.totals_by_user.len(),
        event_count: batch.event_count,
        total_amount,
    })
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
