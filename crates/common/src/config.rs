//! Service configuration from environment variables.
//!
//! Mirrors the deployment convention of the rest of the platform: every
//! knob is a `MERX_*` variable with a safe default, numeric values parse
//! into typed errors instead of panicking.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::backoff::RetryConfig;
use crate::error::SettlementError;

/// Runtime configuration of the settlement service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen address (`MERX_LISTEN_ADDR`, default `0.0.0.0:8461`).
    pub listen_addr: SocketAddr,
    /// LMDB data directory (`MERX_DATA_DIR`, default `./merx-data`).
    pub data_dir: PathBuf,
    /// Settlement-chain RPC endpoint (`MERX_CHAIN_RPC_URL`).
    pub chain_rpc_url: String,
    /// Optional bearer token for the chain RPC (`MERX_CHAIN_AUTH_TOKEN`).
    pub chain_auth_token: Option<String>,
    /// On-chain claim program identifier (`MERX_PROGRAM_ID`).
    pub program_id: String,
    /// Operator token required on `/admin/*` routes (`MERX_ADMIN_TOKEN`).
    /// `None` disables the admin surface entirely.
    pub admin_token: Option<String>,
    /// Whether the destructive week reset is available
    /// (`MERX_ALLOW_RESET=1`, development only).
    pub allow_reset: bool,
    /// Backoff policy for claim confirmation retries.
    pub claim_retry: RetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8461)),
            data_dir: PathBuf::from("./merx-data"),
            chain_rpc_url: "http://localhost:8899".to_string(),
            chain_auth_token: None,
            program_id: "merx-claim-program".to_string(),
            admin_token: None,
            allow_reset: false,
            claim_retry: RetryConfig::claim_confirmation(),
        }
    }
}

impl ServiceConfig {
    /// Build configuration from `MERX_*` environment variables.
    pub fn from_env() -> Result<Self, SettlementError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MERX_LISTEN_ADDR") {
            config.listen_addr = addr.parse().map_err(|_| SettlementError::InvalidInput {
                message: format!("MERX_LISTEN_ADDR is not a socket address: {addr}"),
            })?;
        }
        if let Ok(dir) = std::env::var("MERX_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("MERX_CHAIN_RPC_URL") {
            config.chain_rpc_url = url;
        }
        if let Ok(token) = std::env::var("MERX_CHAIN_AUTH_TOKEN") {
            if !token.is_empty() {
                config.chain_auth_token = Some(token);
            }
        }
        if let Ok(program) = std::env::var("MERX_PROGRAM_ID") {
            config.program_id = program;
        }
        if let Ok(token) = std::env::var("MERX_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }
        if let Ok(v) = std::env::var("MERX_ALLOW_RESET") {
            config.allow_reset = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MERX_CLAIM_MAX_RETRIES") {
            config.claim_retry.max_retries =
                v.parse().map_err(|_| SettlementError::InvalidInput {
                    message: format!("MERX_CLAIM_MAX_RETRIES is not a number: {v}"),
                })?;
        }

        Ok(config)
    }
}
