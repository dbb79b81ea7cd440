//! # merx_common
//!
//! Shared foundation for the MERX reward settlement engine:
//!
//! - Domain types: [`WeekKey`], [`UserKey`], reward events/batches,
//!   claim epochs/leaves/receipts.
//! - [`SettlementError`]: the single error taxonomy crossing crate
//!   boundaries (policy / transient / hard / infra).
//! - Keccak-256 hashing and the leaf/proof primitives that must stay
//!   byte-identical between the epoch builder and every verifier.
//! - [`RetryConfig`] backoff policy and the retry helper.
//! - [`ChainGateway`]: the settlement-chain abstraction, with an
//!   in-memory mock for tests and an HTTP client for deployments.

pub mod backoff;
pub mod chain;
pub mod config;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod mock_chain;
pub mod rpc_chain;
pub mod types;

pub use backoff::{compute_delay, retry_with_backoff, RetryConfig, RetryResult};
pub use chain::{AccountRefs, ChainGateway, ClaimEvidence, EpochRootAccount};
pub use config::ServiceConfig;
pub use error::{ErrorClass, SettlementError};
pub use mock_chain::MockChain;
pub use rpc_chain::RpcChainGateway;
pub use types::{
    BatchStatus, ClaimEpoch, ClaimLeaf, ClaimReceipt, EpochVersion, RewardBatch, RewardEvent,
    RewardKind, UserKey, WeekKey, DECIMALS_MULT, LEDGER_DECIMALS, MINT_DECIMALS,
};
