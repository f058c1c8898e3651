//! Block template construction.
//!
//! A pure snapshot of the chain manager: no caching, no I/O beyond
//! reading the tip and the pools. The cache layer in
//! [`super::server`] decides when to call this.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::types::encoding::WireEncode;
use crate::types::{Address, ChainIndex, Currency, Hash256, Output, Transaction, V2Transaction};

use super::types::{GetBlockTemplateResponse, TemplateTransaction};
use super::{ChainManager, Error};

const LONG_POLL_TAG: &[u8] = b"template/longpoll";

/// Builds a fresh template from the chain manager's current tip and
/// pools.
///
/// Transactions enter the template in pool order; the pool owns
/// dependency ordering and no re-sorting happens here. Fails only
/// when no payout address is configured.
pub fn generate_block_template(
    cm: &dyn ChainManager,
    payout_addr: Address,
) -> Result<GetBlockTemplateResponse, Error> {
    if payout_addr == Address::VOID {
        return Err(Error::NoPayoutAddress);
    }

    let cs = cm.tip_state();
    let tip = cs.index;
    let version = cs.block_version();

    let txns = cm.pool_transactions();
    let v2_txns = if version == 2 {
        cm.v2_pool_transactions()
    } else {
        // A legacy block has no slot for V2 transactions.
        Vec::new()
    };

    let fees: Currency = txns
        .iter()
        .map(|t| t.miner_fee)
        .chain(v2_txns.iter().map(|t| t.miner_fee))
        .sum();
    let payout = Output {
        value: cs.block_subsidy() + fees,
        address: payout_addr,
    };

    let commitment = if version == 2 {
        cs.commitment(payout_addr, &txns, &v2_txns)
    } else {
        Hash256::ZERO
    };

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut transactions = Vec::with_capacity(txns.len() + v2_txns.len());
    for txn in &txns {
        transactions.push(template_txn(
            txn.wire_bytes(),
            txn.txid().to_string(),
            txn.miner_fee,
            "1",
        ));
    }
    for txn in &v2_txns {
        transactions.push(template_txn(
            txn.wire_bytes(),
            txn.txid().to_string(),
            txn.miner_fee,
            "2",
        ));
    }

    let miner_payout = TemplateTransaction {
        data: hex::encode(payout.wire_bytes_for_version(version)),
        hash: String::new(),
        txid: String::new(),
        depends: None,
        fee: 0,
        sigops: 0,
        tx_type: String::new(),
    };

    Ok(GetBlockTemplateResponse {
        long_poll_id: long_poll_id(&tip, &txns, &v2_txns, payout_addr, version, timestamp),
        transactions,
        miner_payout: vec![miner_payout],
        previous_block_hash: tip.id.to_string(),
        target: cs.pow_target().to_string(),
        height: cs.child_height(),
        timestamp,
        version,
        bits: format!("{:08x}", cs.compact_bits()),
        commitment: commitment.to_string(),
    })
}

fn template_txn(wire: Vec<u8>, txid: String, fee: Currency, tx_type: &str) -> TemplateTransaction {
    TemplateTransaction {
        data: hex::encode(wire),
        hash: String::new(),
        txid,
        depends: None,
        fee: fee.0,
        sigops: 0,
        tx_type: tx_type.into(),
    }
}

/// 128-bit fingerprint of everything that determines a template: the
/// tip, the included txids in order, the payout address, the version,
/// and the template's own timestamp (so a max-age regeneration hands
/// parked clients a fresh id).
fn long_poll_id(
    tip: &ChainIndex,
    txns: &[Transaction],
    v2_txns: &[V2Transaction],
    payout_addr: Address,
    version: u8,
    timestamp: u64,
) -> String {
    let mut h = Sha256::new();
    h.update(LONG_POLL_TAG);
    h.update(tip.id.0 .0);
    h.update(tip.height.to_le_bytes());
    for txn in txns {
        h.update(txn.txid().0 .0);
    }
    for txn in v2_txns {
        h.update(txn.txid().0 .0);
    }
    h.update(payout_addr.0 .0);
    h.update([version]);
    h.update(timestamp.to_le_bytes());
    hex::encode(&h.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Manager;
    use crate::testutil::{self, test_addr};
    use crate::types::Output;

    #[test]
    fn refuses_void_payout_address() {
        let cm = Manager::new(testutil::v1_network());
        assert!(matches!(
            generate_block_template(&cm, Address::VOID),
            Err(Error::NoPayoutAddress)
        ));
    }

    #[test]
    fn v1_template_fields() {
        let cm = Manager::new(testutil::v1_network());
        let tip = cm.tip();
        let resp = generate_block_template(&cm, test_addr(1)).unwrap();

        assert_eq!(resp.version, 1);
        assert_eq!(resp.height, tip.height + 1);
        assert_eq!(resp.previous_block_hash, tip.id.to_string());
        assert_eq!(resp.commitment, Hash256::ZERO.to_string());
        assert!(resp.transactions.is_empty());
        assert_eq!(resp.target, cm.tip_state().pow_target().to_string());

        // The payout entry decodes to subsidy-to-address.
        let raw = hex::decode(&resp.miner_payout[0].data).unwrap();
        let mut d = crate::types::encoding::Decoder::new(&raw);
        let payout = Output::decode_v1(&mut d).unwrap();
        assert_eq!(payout.address, test_addr(1));
        assert_eq!(payout.value, cm.tip_state().block_subsidy());
    }

    #[test]
    fn transactions_keep_pool_order() {
        let cm = Manager::new(testutil::v1_network());
        let txns: Vec<_> = (0..4u8)
            .map(|i| Transaction {
                outputs: Vec::new(),
                miner_fee: Currency(i as u64 * 10),
                arbitrary_data: vec![i],
            })
            .collect();
        cm.add_pool_transactions(txns.clone());

        let resp = generate_block_template(&cm, test_addr(1)).unwrap();
        let got: Vec<String> = resp.transactions.iter().map(|t| t.txid.clone()).collect();
        let want: Vec<String> = txns.iter().map(|t| t.txid().to_string()).collect();
        // FIFO from the pool, not fee-sorted.
        assert_eq!(got, want);
    }

    #[test]
    fn v2_template_carries_commitment_and_both_pools() {
        let harness = testutil::NodeHarness::new(testutil::v2_network());
        harness.mine_blocks(3, test_addr(9)).unwrap();
        let cm = &harness.cm;

        let v1_txn = Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(5),
            arbitrary_data: b"legacy".to_vec(),
        };
        let v2_txn = V2Transaction {
            outputs: Vec::new(),
            miner_fee: Currency(7),
            arbitrary_data: b"modern".to_vec(),
        };
        cm.add_pool_transactions(vec![v1_txn.clone()]);
        cm.add_v2_pool_transactions(vec![v2_txn.clone()]);

        let resp = generate_block_template(cm.as_ref(), test_addr(1)).unwrap();
        assert_eq!(resp.version, 2);
        let types: Vec<&str> = resp
            .transactions
            .iter()
            .map(|t| t.tx_type.as_str())
            .collect();
        assert_eq!(types, ["1", "2"]);

        let want = cm.tip_state().commitment(
            test_addr(1),
            std::slice::from_ref(&v1_txn),
            std::slice::from_ref(&v2_txn),
        );
        assert_eq!(resp.commitment, want.to_string());
        assert_ne!(resp.commitment, Hash256::ZERO.to_string());
    }

    #[test]
    fn long_poll_id_tracks_template_inputs() {
        let tip_a = ChainIndex {
            height: 5,
            id: crate::types::BlockId(Hash256([1; 32])),
        };
        let tip_b = ChainIndex {
            height: 6,
            id: crate::types::BlockId(Hash256([2; 32])),
        };
        let base = long_poll_id(&tip_a, &[], &[], test_addr(1), 1, 100);
        assert_eq!(base.len(), 32);
        assert_eq!(base, long_poll_id(&tip_a, &[], &[], test_addr(1), 1, 100));
        assert_ne!(base, long_poll_id(&tip_b, &[], &[], test_addr(1), 1, 100));
        assert_ne!(base, long_poll_id(&tip_a, &[], &[], test_addr(2), 1, 100));
        assert_ne!(base, long_poll_id(&tip_a, &[], &[], test_addr(1), 2, 100));
        assert_ne!(base, long_poll_id(&tip_a, &[], &[], test_addr(1), 1, 101));
    }
}
