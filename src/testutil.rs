//! Test harness: dev networks, a single-node chain, and helpers for
//! grinding valid blocks.
//!
//! Everything here is test support, but it lives in the library so
//! integration tests (and doctests) can reach it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::api::{Client, Server, ServerOptions, Syncer};
use crate::chain::Manager;
use crate::consensus::{HardforkV2, Network};
use crate::types::{
    Address, Block, BlockHeader, Currency, Hash256, Output, V2BlockData, V2BlockOutline,
};

/// A deterministic test address: 32 copies of `n`.
pub fn test_addr(n: u8) -> Address {
    Address(Hash256([n; 32]))
}

fn easy_target() -> Hash256 {
    // Roughly one in sixteen ids qualifies, so grinding is instant.
    let mut target = [0xff; 32];
    target[0] = 0x0f;
    Hash256(target)
}

/// A test network that stays on the V1 format.
pub fn v1_network() -> Arc<Network> {
    Arc::new(Network {
        name: "testnet-v1".into(),
        initial_subsidy: Currency(50_000_000_000),
        subsidy_halving_interval: 210_000,
        pow_target: easy_target(),
        genesis_timestamp: 1_700_000_000,
        hardfork_v2: HardforkV2 {
            allow_height: 100_000,
            require_height: 200_000,
        },
    })
}

/// A test network with the V2 hardfork activating almost immediately.
pub fn v2_network() -> Arc<Network> {
    Arc::new(Network {
        name: "testnet-v2".into(),
        initial_subsidy: Currency(50_000_000_000),
        subsidy_halving_interval: 210_000,
        pow_target: easy_target(),
        genesis_timestamp: 1_700_000_000,
        hardfork_v2: HardforkV2 {
            allow_height: 2,
            require_height: 3,
        },
    })
}

/// Grinds the nonce until the block id meets the target, giving up
/// after `max_attempts`.
pub fn find_block_nonce(block: &mut Block, target: &Hash256, max_attempts: u64) -> bool {
    for nonce in 0..max_attempts {
        block.nonce = nonce;
        if block.id().meets_target(target) {
            return true;
        }
    }
    false
}

/// Records broadcasts instead of gossiping them; can be switched to
/// fail on demand.
#[derive(Default)]
pub struct RecordingSyncer {
    headers: Mutex<Vec<BlockHeader>>,
    outlines: Mutex<Vec<V2BlockOutline>>,
    fail: AtomicBool,
}

impl RecordingSyncer {
    pub fn new() -> RecordingSyncer {
        RecordingSyncer::default()
    }

    /// Makes every subsequent broadcast fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn broadcast_headers(&self) -> Vec<BlockHeader> {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn broadcast_outlines(&self) -> Vec<V2BlockOutline> {
        self.outlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_failing(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("gossip layer offline");
        }
        Ok(())
    }
}

impl Syncer for RecordingSyncer {
    fn broadcast_header(&self, header: BlockHeader) -> Result<()> {
        self.check_failing()?;
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(header);
        Ok(())
    }

    fn broadcast_v2_block_outline(&self, outline: V2BlockOutline) -> Result<()> {
        self.check_failing()?;
        self.outlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outline);
        Ok(())
    }
}

/// A bare-bones single-node chain: manager plus recording syncer.
pub struct NodeHarness {
    pub cm: Arc<Manager>,
    pub syncer: Arc<RecordingSyncer>,
}

impl NodeHarness {
    pub fn new(network: Arc<Network>) -> NodeHarness {
        NodeHarness {
            cm: Arc::new(Manager::new(network)),
            syncer: Arc::new(RecordingSyncer::new()),
        }
    }

    /// Mines one block on the current tip, paying `addr`, including
    /// whatever the pools hold.
    pub fn mine_block(&self, addr: Address) -> Result<Block> {
        let cs = self.cm.tip_state();
        let txns = self.cm.pool_transactions();
        let v2_active = cs.block_version() == 2;
        let v2_txns = if v2_active {
            self.cm.v2_pool_transactions()
        } else {
            Vec::new()
        };

        let fees: Currency = txns
            .iter()
            .map(|t| t.miner_fee)
            .chain(v2_txns.iter().map(|t| t.miner_fee))
            .sum();
        let commitment = cs.commitment(addr, &txns, &v2_txns);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut block = Block {
            parent_id: cs.index.id,
            nonce: 0,
            timestamp,
            miner_payouts: vec![Output {
                value: cs.block_subsidy() + fees,
                address: addr,
            }],
            transactions: txns,
            v2: v2_active.then(|| V2BlockData {
                height: cs.child_height(),
                commitment,
                transactions: v2_txns,
            }),
        };
        if !find_block_nonce(&mut block, &cs.pow_target(), 1 << 24) {
            bail!("failed to find a nonce below the target");
        }
        self.cm
            .add_blocks(vec![block.clone()])
            .context("mined block was rejected")?;
        Ok(block)
    }

    pub fn mine_blocks(&self, n: usize, addr: Address) -> Result<()> {
        for _ in 0..n {
            self.mine_block(addr)?;
        }
        Ok(())
    }
}

/// A mining API served over a real socket, plus a client pointed at
/// it.
pub struct ServedApi {
    pub client: Client,
    pub base_url: String,
    _server: Server,
    task: JoinHandle<()>,
}

impl Drop for ServedApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serves the mining API for a harness on an ephemeral port, mounted
/// under `/mining` the way the daemon mounts it.
pub async fn serve_api(
    harness: &NodeHarness,
    payout_addr: Address,
    options: ServerOptions,
) -> Result<ServedApi> {
    let password = options.password.clone();
    let server = Server::new(
        harness.cm.clone(),
        harness.syncer.clone(),
        payout_addr,
        options,
    );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind API listener")?;
    let addr = listener.local_addr()?;
    let app = axum::Router::new().nest("/mining", server.router());
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let base_url = format!("http://{addr}/mining");
    let mut client = Client::new(base_url.as_str());
    if let Some(password) = password {
        client = client.with_password(password);
    }
    Ok(ServedApi {
        client,
        base_url,
        _server: server,
        task,
    })
}
