//! The `forged` daemon: a single-node chain serving the mining
//! template API.
//!
//! Run with no arguments to start the node and API server; `forged
//! version` prints the build version. Configuration comes from
//! `forged.toml` and the `FORGED_*` environment variables (see
//! [`forged::config`]).

use std::env;
use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use forged::api::{Server, Syncer};
use forged::chain::Manager;
use forged::config::Config;
use forged::consensus::Network;
use forged::types::{Address, BlockHeader, V2BlockOutline};

/// Stands in for the gossip layer in single-node deployments:
/// accepted blocks are logged, not relayed.
struct NullSyncer;

impl Syncer for NullSyncer {
    fn broadcast_header(&self, header: BlockHeader) -> Result<()> {
        debug!(id = %header.id(), "no peers; header not relayed");
        Ok(())
    }

    fn broadcast_v2_block_outline(&self, outline: V2BlockOutline) -> Result<()> {
        debug!(height = outline.height, "no peers; block outline not relayed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        None => {}
        Some("version") => {
            println!("forged {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            eprintln!("Usage: forged [version]");
            eprintln!();
            eprintln!("Run 'forged' with no arguments to start the node and API server.");
            std::process::exit(1);
        }
    }

    let cfg = Config::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    let network = match cfg.network.as_str() {
        "mainnet" => Network::mainnet(),
        "devnet" => Network::devnet(),
        other => bail!("unknown network {other:?} (expected \"mainnet\" or \"devnet\")"),
    };

    let payout_addr = cfg.payout_addr()?;
    if payout_addr == Address::VOID {
        warn!("no payout address configured; getblocktemplate will return 503");
    }

    let cm = Arc::new(Manager::new(network.clone()));
    let server = Server::new(cm, Arc::new(NullSyncer), payout_addr, cfg.server_options());
    let app = axum::Router::new().nest("/mining", server.router());

    // Bind before doing anything else: failing fast here beats
    // discovering a duplicate instance after startup.
    let listener = TcpListener::bind(&cfg.http_address)
        .await
        .with_context(|| format!("failed to listen on {:?}", cfg.http_address))?;
    info!(
        addr = %listener.local_addr()?,
        network = %network.name,
        version = env!("CARGO_PKG_VERSION"),
        "forged started"
    );

    // Dropping the serve future on shutdown closes the listener and
    // its connections, which is what unparks long-polling clients.
    tokio::select! {
        res = axum::serve(listener, app).into_future() => res.context("HTTP server exited")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
