//! Network parameters and per-tip consensus state.
//!
//! A [`Network`] is the static rule set: subsidy schedule,
//! proof-of-work target, and the heights at which the V2 block format
//! activates. A [`ChainState`] pairs a network with a tip index and
//! answers the questions template construction and block validation
//! ask: what version is the next block, what is it worth, what must
//! its commitment be.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::encoding::{Encoder, WireEncode};
use crate::types::{
    Address, Block, BlockId, ChainIndex, Currency, Hash256, Transaction, V2Transaction,
};

const COMMITMENT_TAG: &[u8] = b"state/commitment";

/// Heights at which the V2 block format activates.
///
/// Between `allow_height` and `require_height` both formats are
/// accepted; template construction switches to V2 as soon as the tip
/// reaches `allow_height`.
#[derive(Debug, Clone)]
pub struct HardforkV2 {
    pub allow_height: u64,
    pub require_height: u64,
}

/// Static parameters of a chain network.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub initial_subsidy: Currency,
    pub subsidy_halving_interval: u64,
    pub pow_target: Hash256,
    pub genesis_timestamp: u64,
    pub hardfork_v2: HardforkV2,
}

impl Network {
    /// The production network. The V2 hardfork activates well past
    /// the current chain height.
    pub fn mainnet() -> Arc<Network> {
        let mut target = [0xff; 32];
        target[..4].fill(0);
        Arc::new(Network {
            name: "mainnet".into(),
            initial_subsidy: Currency(50_000_000_000),
            subsidy_halving_interval: 210_000,
            pow_target: Hash256(target),
            genesis_timestamp: 1_717_200_000,
            hardfork_v2: HardforkV2 {
                allow_height: 526_000,
                require_height: 530_000,
            },
        })
    }

    /// A single-node development network: trivially easy target, V2
    /// activating almost immediately.
    pub fn devnet() -> Arc<Network> {
        let mut target = [0xff; 32];
        target[0] = 0x0f;
        Arc::new(Network {
            name: "devnet".into(),
            initial_subsidy: Currency(50_000_000_000),
            subsidy_halving_interval: 210_000,
            pow_target: Hash256(target),
            genesis_timestamp: 1_717_200_000,
            hardfork_v2: HardforkV2 {
                allow_height: 50,
                require_height: 100,
            },
        })
    }

    /// The deterministic first block of this network.
    pub fn genesis_block(&self) -> Block {
        Block {
            parent_id: BlockId(Hash256::ZERO),
            nonce: 0,
            timestamp: self.genesis_timestamp,
            miner_payouts: Vec::new(),
            transactions: Vec::new(),
            v2: None,
        }
    }

    /// Subsidy for a block at the given height: the initial subsidy,
    /// halved every `subsidy_halving_interval` blocks.
    pub fn block_subsidy(&self, height: u64) -> Currency {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            return Currency::ZERO;
        }
        Currency(self.initial_subsidy.0 >> halvings)
    }
}

/// Consensus state as of a particular tip.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub network: Arc<Network>,
    pub index: ChainIndex,
}

impl ChainState {
    /// Height of the next block.
    pub fn child_height(&self) -> u64 {
        self.index.height + 1
    }

    /// Format version of the next block: 2 once the tip has reached
    /// the V2 allow height, 1 before.
    pub fn block_version(&self) -> u8 {
        if self.index.height >= self.network.hardfork_v2.allow_height {
            2
        } else {
            1
        }
    }

    pub fn pow_target(&self) -> Hash256 {
        self.network.pow_target
    }

    /// The target in Bitcoin-style compact form, for the template's
    /// `bits` field.
    pub fn compact_bits(&self) -> u32 {
        compact_from_target(&self.network.pow_target)
    }

    /// Subsidy of the next block.
    pub fn block_subsidy(&self) -> Currency {
        self.network.block_subsidy(self.child_height())
    }

    /// The V2 commitment a child block must carry: binds this state,
    /// the miner's payout address, and every included txid in order.
    pub fn commitment(
        &self,
        payout_addr: Address,
        txns: &[Transaction],
        v2_txns: &[V2Transaction],
    ) -> Hash256 {
        let mut e = Encoder::new();
        self.index.id.encode(&mut e);
        payout_addr.encode(&mut e);
        e.write_u64(txns.len() as u64);
        for txn in txns {
            txn.txid().encode(&mut e);
        }
        e.write_u64(v2_txns.len() as u64);
        for txn in v2_txns {
            txn.txid().encode(&mut e);
        }

        let mut h = Sha256::new();
        h.update(COMMITMENT_TAG);
        h.update(e.finish());
        Hash256(h.finalize().into())
    }
}

/// Encodes a 256-bit target as Bitcoin-style compact bits.
fn compact_from_target(target: &Hash256) -> u32 {
    let bytes = target.0;
    let zeros = bytes.iter().take_while(|&&b| b == 0).count();
    let size = 32 - zeros;
    if size == 0 {
        return 0;
    }
    let mut mantissa = 0u32;
    for i in 0..3 {
        mantissa <<= 8;
        if zeros + i < 32 {
            mantissa |= bytes[zeros + i] as u32;
        }
    }
    // Keep the sign bit of the mantissa clear.
    let (mantissa, size) = if mantissa & 0x0080_0000 != 0 {
        (mantissa >> 8, size + 1)
    } else {
        (mantissa, size)
    };
    ((size as u32) << 24) | mantissa
}
