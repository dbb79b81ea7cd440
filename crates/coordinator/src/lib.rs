//! # merx_coordinator
//!
//! The claim coordinator and the operator control plane.
//!
//! - [`confirm`]: the server-side claim confirmation protocol: verify a
//!   claim against a published epoch, cooperate with the chain's
//!   eventual-consistency window, and settle at-most-once through the
//!   store's receipt constraint.
//! - [`discovery`]: which epochs a wallet can still claim, with proofs
//!   and derived account references.
//! - [`control`]: guarded operator transitions: freeze, build, publish,
//!   mark-on-chain, reset.
//! - [`handlers`]: the axum HTTP surface over all of the above.

pub mod confirm;
pub mod control;
pub mod discovery;
pub mod handlers;

pub use confirm::{confirm_claim, confirm_claim_with_retry, ClaimOutcome, ClaimRequest};
pub use control::{ControlPlane, MarkOutcome, PublishOutcome};
pub use discovery::{claimable_epochs, ClaimableEntry};
pub use handlers::{router, AppState};
