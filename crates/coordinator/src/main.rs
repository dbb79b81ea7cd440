//! Settlement coordinator binary: config, storage, chain gateway and
//! the HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use merx_common::{ChainGateway, MockChain, RpcChainGateway, ServiceConfig};
use merx_coordinator::{router, AppState, ControlPlane};
use merx_store::SettlementDb;

/// MERX reward settlement coordinator.
#[derive(Debug, Parser)]
#[command(name = "merx-coordinator", version)]
struct Cli {
    /// Override the listen address (`MERX_LISTEN_ADDR`).
    #[arg(long)]
    listen: Option<String>,

    /// Override the data directory (`MERX_DATA_DIR`).
    #[arg(long)]
    data_dir: Option<String>,

    /// Use the in-memory mock chain instead of the RPC gateway.
    /// Development only: published roots and claims live in process.
    #[arg(long)]
    mock_chain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::from_env().context("loading MERX_* configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen.parse().context("parsing --listen")?;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir.into();
    }

    let db = Arc::new(SettlementDb::open(&config.data_dir).context("opening settlement db")?);

    let gateway: Arc<dyn ChainGateway> = if cli.mock_chain {
        info!("using in-memory mock chain gateway");
        Arc::new(MockChain::new(config.program_id.clone()))
    } else {
        Arc::new(RpcChainGateway::new(
            config.chain_rpc_url.clone(),
            config.program_id.clone(),
            config.chain_auth_token.clone(),
        ))
    };

    let control = ControlPlane::new(db.clone(), gateway.clone(), config.allow_reset);
    let state = Arc::new(AppState {
        db,
        gateway,
        control,
        config: config.clone(),
    });

    let app = router(state);
    info!(addr = %config.listen_addr, "settlement coordinator listening");
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("binding listen address")?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
