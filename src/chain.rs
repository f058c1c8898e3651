//! In-memory chain manager.
//!
//! A single-node chain: a tip, a block store, the V1/V2 transaction
//! pools, and a listener registry. It implements the capability set
//! the mining API consumes ([`crate::api::ChainManager`]) and is the
//! chain layer behind the daemon's solo/regtest mode and the test
//! suite. It is not a gossip-synced consensus database.
//!
//! Listener callbacks are always invoked outside the manager's
//! internal lock, so a callback may freely call back into the
//! manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tracing::debug;

use crate::api::Subscription;
use crate::consensus::{ChainState, Network};
use crate::types::{Block, BlockId, ChainIndex, Currency, Transaction, V2Transaction};

/// Block rejected by the chain manager.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block does not attach to the current tip")]
    UnknownParent,
    #[error("block id {id} does not meet the proof-of-work target")]
    InsufficientWork { id: BlockId },
    #[error("V1 block at height {height} is past the V2 require height")]
    V1PastRequireHeight { height: u64 },
    #[error("V2 block at height {height} is before the V2 allow height")]
    V2BeforeAllowHeight { height: u64 },
    #[error("V2 data claims height {got}, expected {expected}")]
    WrongV2Height { got: u64, expected: u64 },
    #[error("V2 commitment does not bind the block contents")]
    WrongCommitment,
    #[error("block has no miner payout")]
    MissingPayout,
    #[error("miner payout {got} does not equal subsidy plus fees {expected}")]
    WrongPayout { got: Currency, expected: Currency },
}

type PoolListener = Arc<dyn Fn() + Send + Sync>;
type ReorgListener = Arc<dyn Fn(ChainIndex) + Send + Sync>;

struct Inner {
    network: Arc<Network>,
    tip: ChainIndex,
    blocks: HashMap<BlockId, Block>,
    pool: Vec<Transaction>,
    v2_pool: Vec<V2Transaction>,
    next_listener_id: u64,
    pool_listeners: HashMap<u64, PoolListener>,
    reorg_listeners: HashMap<u64, ReorgListener>,
}

/// A single-node, in-memory chain.
pub struct Manager {
    inner: Arc<Mutex<Inner>>,
}

impl Manager {
    /// Creates a manager whose chain consists of the network's
    /// genesis block.
    pub fn new(network: Arc<Network>) -> Manager {
        let genesis = network.genesis_block();
        let genesis_id = genesis.id();
        Manager {
            inner: Arc::new(Mutex::new(Inner {
                network,
                tip: ChainIndex {
                    height: 0,
                    id: genesis_id,
                },
                blocks: HashMap::from([(genesis_id, genesis)]),
                pool: Vec::new(),
                v2_pool: Vec::new(),
                next_listener_id: 0,
                pool_listeners: HashMap::new(),
                reorg_listeners: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tip(&self) -> ChainIndex {
        self.lock().tip
    }

    pub fn tip_state(&self) -> ChainState {
        let inner = self.lock();
        ChainState {
            network: inner.network.clone(),
            index: inner.tip,
        }
    }

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.lock().blocks.get(&id).cloned()
    }

    /// Snapshot of the legacy pool, in insertion order.
    pub fn pool_transactions(&self) -> Vec<Transaction> {
        self.lock().pool.clone()
    }

    /// Snapshot of the post-hardfork pool, in insertion order.
    pub fn v2_pool_transactions(&self) -> Vec<V2Transaction> {
        self.lock().v2_pool.clone()
    }

    /// Appends transactions to the legacy pool, skipping ids already
    /// pooled. Callers are responsible for dependency ordering.
    pub fn add_pool_transactions(&self, txns: Vec<Transaction>) {
        let listeners = {
            let mut inner = self.lock();
            let known: HashSet<_> = inner.pool.iter().map(Transaction::txid).collect();
            let fresh: Vec<_> = txns
                .into_iter()
                .filter(|t| !known.contains(&t.txid()))
                .collect();
            if fresh.is_empty() {
                return;
            }
            inner.pool.extend(fresh);
            inner.pool_listener_snapshot()
        };
        for f in listeners {
            f();
        }
    }

    /// Appends transactions to the post-hardfork pool, skipping ids
    /// already pooled.
    pub fn add_v2_pool_transactions(&self, txns: Vec<V2Transaction>) {
        let listeners = {
            let mut inner = self.lock();
            let known: HashSet<_> = inner.v2_pool.iter().map(V2Transaction::txid).collect();
            let fresh: Vec<_> = txns
                .into_iter()
                .filter(|t| !known.contains(&t.txid()))
                .collect();
            if fresh.is_empty() {
                return;
            }
            inner.v2_pool.extend(fresh);
            inner.pool_listener_snapshot()
        };
        for f in listeners {
            f();
        }
    }

    /// Validates and applies blocks in order, advancing the tip.
    pub fn add_blocks(&self, blocks: Vec<Block>) -> Result<(), ChainError> {
        for block in blocks {
            self.add_block(block)?;
        }
        Ok(())
    }

    fn add_block(&self, block: Block) -> Result<(), ChainError> {
        let (new_tip, pool_changed, reorg_listeners, pool_listeners) = {
            let mut inner = self.lock();
            let height = inner.tip.height + 1;

            if block.parent_id != inner.tip.id {
                return Err(ChainError::UnknownParent);
            }
            let id = block.id();
            if !id.meets_target(&inner.network.pow_target) {
                return Err(ChainError::InsufficientWork { id });
            }
            if block.miner_payouts.is_empty() {
                return Err(ChainError::MissingPayout);
            }

            match &block.v2 {
                None => {
                    if height >= inner.network.hardfork_v2.require_height {
                        return Err(ChainError::V1PastRequireHeight { height });
                    }
                }
                Some(v2) => {
                    if height < inner.network.hardfork_v2.allow_height {
                        return Err(ChainError::V2BeforeAllowHeight { height });
                    }
                    if v2.height != height {
                        return Err(ChainError::WrongV2Height {
                            got: v2.height,
                            expected: height,
                        });
                    }
                    let parent_state = ChainState {
                        network: inner.network.clone(),
                        index: inner.tip,
                    };
                    let want = parent_state.commitment(
                        block.miner_payouts[0].address,
                        &block.transactions,
                        &v2.transactions,
                    );
                    if v2.commitment != want {
                        return Err(ChainError::WrongCommitment);
                    }
                }
            }

            let fees: Currency = block
                .transactions
                .iter()
                .map(|t| t.miner_fee)
                .chain(block.v2_transactions().iter().map(|t| t.miner_fee))
                .sum();
            let expected = inner.network.block_subsidy(height) + fees;
            let got: Currency = block.miner_payouts.iter().map(|o| o.value).sum();
            if got != expected {
                return Err(ChainError::WrongPayout { got, expected });
            }

            // Apply: drop included transactions from the pools and
            // advance the tip.
            let mut pool_changed = false;
            if !block.transactions.is_empty() {
                let included: HashSet<_> = block.transactions.iter().map(Transaction::txid).collect();
                let before = inner.pool.len();
                inner.pool.retain(|t| !included.contains(&t.txid()));
                pool_changed |= inner.pool.len() != before;
            }
            if !block.v2_transactions().is_empty() {
                let included: HashSet<_> = block
                    .v2_transactions()
                    .iter()
                    .map(V2Transaction::txid)
                    .collect();
                let before = inner.v2_pool.len();
                inner.v2_pool.retain(|t| !included.contains(&t.txid()));
                pool_changed |= inner.v2_pool.len() != before;
            }

            let new_tip = ChainIndex { height, id };
            inner.blocks.insert(id, block);
            inner.tip = new_tip;

            (
                new_tip,
                pool_changed,
                inner.reorg_listener_snapshot(),
                inner.pool_listener_snapshot(),
            )
        };

        debug!(height = new_tip.height, id = %new_tip.id, "applied block");
        for f in reorg_listeners {
            f(new_tip);
        }
        if pool_changed {
            for f in pool_listeners {
                f();
            }
        }
        Ok(())
    }

    /// Registers a pool-change listener; dropping the subscription
    /// deregisters it.
    pub fn on_pool_change(&self, f: Box<dyn Fn() + Send + Sync>) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.pool_listeners.insert(id, Arc::from(f));
        Subscription::new(unsubscribe(Arc::downgrade(&self.inner), id, |inner, id| {
            inner.pool_listeners.remove(&id);
        }))
    }

    /// Registers a tip-change listener; dropping the subscription
    /// deregisters it.
    pub fn on_reorg(&self, f: Box<dyn Fn(ChainIndex) + Send + Sync>) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.reorg_listeners.insert(id, Arc::from(f));
        Subscription::new(unsubscribe(Arc::downgrade(&self.inner), id, |inner, id| {
            inner.reorg_listeners.remove(&id);
        }))
    }
}

impl Inner {
    fn pool_listener_snapshot(&self) -> Vec<PoolListener> {
        self.pool_listeners.values().cloned().collect()
    }

    fn reorg_listener_snapshot(&self) -> Vec<ReorgListener> {
        self.reorg_listeners.values().cloned().collect()
    }
}

fn unsubscribe(
    inner: Weak<Mutex<Inner>>,
    id: u64,
    remove: impl FnOnce(&mut Inner, u64) + Send + Sync + 'static,
) -> impl FnOnce() + Send + Sync + 'static {
    move || {
        if let Some(inner) = inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            remove(&mut inner, id);
        }
    }
}

impl crate::api::ChainManager for Manager {
    fn tip(&self) -> ChainIndex {
        Manager::tip(self)
    }

    fn tip_state(&self) -> ChainState {
        Manager::tip_state(self)
    }

    fn block(&self, id: BlockId) -> Option<Block> {
        Manager::block(self, id)
    }

    fn pool_transactions(&self) -> Vec<Transaction> {
        Manager::pool_transactions(self)
    }

    fn v2_pool_transactions(&self) -> Vec<V2Transaction> {
        Manager::v2_pool_transactions(self)
    }

    fn add_blocks(&self, blocks: Vec<Block>) -> anyhow::Result<()> {
        Manager::add_blocks(self, blocks).map_err(Into::into)
    }

    fn on_pool_change(&self, f: Box<dyn Fn() + Send + Sync>) -> Subscription {
        Manager::on_pool_change(self, f)
    }

    fn on_reorg(&self, f: Box<dyn Fn(ChainIndex) + Send + Sync>) -> Subscription {
        Manager::on_reorg(self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testutil::{self, test_addr};
    use crate::types::{Hash256, Output, V2BlockData};

    #[test]
    fn mined_block_advances_tip() {
        let harness = testutil::NodeHarness::new(testutil::v1_network());
        let genesis_tip = harness.cm.tip();
        let block = harness.mine_block(test_addr(1)).unwrap();
        let tip = harness.cm.tip();
        assert_eq!(tip.height, genesis_tip.height + 1);
        assert_eq!(tip.id, block.id());
        assert_eq!(harness.cm.block(block.id()), Some(block));
    }

    #[test]
    fn rejects_block_off_the_tip() {
        let harness = testutil::NodeHarness::new(testutil::v1_network());
        harness.mine_blocks(2, test_addr(1)).unwrap();

        let stale = Block {
            parent_id: BlockId(Hash256([0xde; 32])),
            nonce: 0,
            timestamp: 0,
            miner_payouts: vec![Output {
                value: Currency(1),
                address: test_addr(1),
            }],
            transactions: Vec::new(),
            v2: None,
        };
        assert!(matches!(
            harness.cm.add_blocks(vec![stale]),
            Err(ChainError::UnknownParent)
        ));
    }

    #[test]
    fn rejects_insufficient_work() {
        // A zero target admits no block id at all.
        let mut network = (*testutil::v1_network()).clone();
        network.pow_target = Hash256::ZERO;
        let cm = Manager::new(Arc::new(network));
        let cs = cm.tip_state();

        let block = Block {
            parent_id: cs.index.id,
            nonce: 0,
            timestamp: 1,
            miner_payouts: vec![Output {
                value: cs.block_subsidy(),
                address: test_addr(1),
            }],
            transactions: Vec::new(),
            v2: None,
        };
        assert!(matches!(
            cm.add_blocks(vec![block]),
            Err(ChainError::InsufficientWork { .. })
        ));
    }

    #[test]
    fn rejects_wrong_v2_commitment() {
        let harness = testutil::NodeHarness::new(testutil::v2_network());
        harness.mine_blocks(3, test_addr(1)).unwrap();
        let cs = harness.cm.tip_state();

        let mut block = Block {
            parent_id: cs.index.id,
            nonce: 0,
            timestamp: 1,
            miner_payouts: vec![Output {
                value: cs.block_subsidy(),
                address: test_addr(1),
            }],
            transactions: Vec::new(),
            v2: Some(V2BlockData {
                height: cs.child_height(),
                commitment: Hash256([0xbb; 32]),
                transactions: Vec::new(),
            }),
        };
        assert!(testutil::find_block_nonce(
            &mut block,
            &cs.pow_target(),
            1 << 20
        ));
        assert!(matches!(
            harness.cm.add_blocks(vec![block]),
            Err(ChainError::WrongCommitment)
        ));
    }

    #[test]
    fn accepting_block_clears_pooled_transactions() {
        let harness = testutil::NodeHarness::new(testutil::v1_network());
        let txn = Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(9),
            arbitrary_data: b"pooled".to_vec(),
        };
        harness.cm.add_pool_transactions(vec![txn.clone()]);
        assert_eq!(harness.cm.pool_transactions(), vec![txn]);

        harness.mine_block(test_addr(1)).unwrap();
        assert!(harness.cm.pool_transactions().is_empty());
    }

    #[test]
    fn listeners_fire_and_deregister_on_drop() {
        let harness = testutil::NodeHarness::new(testutil::v1_network());
        let pool_calls = Arc::new(AtomicUsize::new(0));
        let reorg_calls = Arc::new(AtomicUsize::new(0));

        let pc = pool_calls.clone();
        let pool_sub = harness
            .cm
            .on_pool_change(Box::new(move || {
                pc.fetch_add(1, Ordering::SeqCst);
            }));
        let rc = reorg_calls.clone();
        let _reorg_sub = harness
            .cm
            .on_reorg(Box::new(move |_| {
                rc.fetch_add(1, Ordering::SeqCst);
            }));

        harness.cm.add_pool_transactions(vec![Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(1),
            arbitrary_data: b"a".to_vec(),
        }]);
        assert_eq!(pool_calls.load(Ordering::SeqCst), 1);

        // Re-adding the same transaction is a no-op: no event.
        harness.cm.add_pool_transactions(vec![Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(1),
            arbitrary_data: b"a".to_vec(),
        }]);
        assert_eq!(pool_calls.load(Ordering::SeqCst), 1);

        harness.mine_block(test_addr(1)).unwrap();
        assert_eq!(reorg_calls.load(Ordering::SeqCst), 1);
        // Mining consumed the pooled transaction, so the pool changed
        // again.
        assert_eq!(pool_calls.load(Ordering::SeqCst), 2);

        drop(pool_sub);
        harness.cm.add_pool_transactions(vec![Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(2),
            arbitrary_data: b"b".to_vec(),
        }]);
        assert_eq!(pool_calls.load(Ordering::SeqCst), 2);
    }
}
