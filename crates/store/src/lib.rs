//! # merx_store
//!
//! LMDB-backed persistence for the settlement engine. One environment,
//! one named database per record family, bincode values.
//!
//! The receipt table is the system's linearization point: inserts use
//! `NO_OVERWRITE`, so of N concurrent confirmations for the same
//! (epoch, user) exactly one wins and the rest surface
//! `ALREADY_CLAIMED`. No in-process mutex is load-bearing.

pub mod db;

pub use db::{ResetCounts, SettlementDb, StoreError};
