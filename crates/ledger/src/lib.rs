//! # merx_ledger
//!
//! The reward ledger: append-only event recording and the weekly batch
//! freeze. Producers (rating/comment/vote handlers) call
//! [`record_event`] concurrently; the operator cycle calls
//! [`freeze_batch`] once per payout week, with explicit force and
//! makeup variants for recovery.

pub mod freeze;

pub use freeze::{freeze_batch, record_event, FreezeOptions, FreezeOutcome};
