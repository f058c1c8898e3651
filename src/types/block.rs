//! Transactions, blocks, and their V1/V2 wire layouts.
//!
//! The hardfork split the chain's wire formats: legacy ("V1")
//! structures and post-hardfork ("V2") structures encode differently
//! and hash under different domain tags. A V2 block additionally
//! binds a commitment over its payout and transaction set into the
//! header, and still carries V1 transactions alongside the V2 set.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use super::encoding::{DecodeError, Decoder, Encoder, WireDecode, WireEncode};
use super::{Address, BlockId, Currency, Hash256, TransactionId};

const TXN_V1_TAG: &[u8] = b"txn/v1";
const TXN_V2_TAG: &[u8] = b"txn/v2";
const BLOCK_ID_TAG: &[u8] = b"block/id";
const V1_CONTENT_TAG: &[u8] = b"block/v1-content";

/// Version marker carried by V2 wire structures.
const V2_VERSION_TAG: u8 = 2;

fn read_v2_tag(d: &mut Decoder<'_>) -> Result<(), DecodeError> {
    match d.read_u8()? {
        V2_VERSION_TAG => Ok(()),
        tag => Err(DecodeError::InvalidVersionTag(tag)),
    }
}

/// A payout: an amount sent to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub value: Currency,
    pub address: Address,
}

impl Output {
    pub fn encode_v1(&self, e: &mut Encoder) {
        self.address.encode(e);
        self.value.encode(e);
    }

    pub fn decode_v1(d: &mut Decoder<'_>) -> Result<Output, DecodeError> {
        let address = Address::decode(d)?;
        let value = Currency::decode(d)?;
        Ok(Output { value, address })
    }

    pub fn encode_v2(&self, e: &mut Encoder) {
        e.write_u8(V2_VERSION_TAG);
        self.value.encode(e);
        self.address.encode(e);
    }

    pub fn decode_v2(d: &mut Decoder<'_>) -> Result<Output, DecodeError> {
        read_v2_tag(d)?;
        let value = Currency::decode(d)?;
        let address = Address::decode(d)?;
        Ok(Output { value, address })
    }

    /// The wire form matching the given block version.
    pub fn wire_bytes_for_version(&self, version: u8) -> Vec<u8> {
        let mut e = Encoder::new();
        if version == 2 {
            self.encode_v2(&mut e);
        } else {
            self.encode_v1(&mut e);
        }
        e.finish()
    }
}

/// A legacy-format transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub outputs: Vec<Output>,
    pub miner_fee: Currency,
    pub arbitrary_data: Vec<u8>,
}

impl Transaction {
    pub fn txid(&self) -> TransactionId {
        let mut h = Sha256::new();
        h.update(TXN_V1_TAG);
        h.update(self.wire_bytes());
        TransactionId(Hash256(h.finalize().into()))
    }
}

impl WireEncode for Transaction {
    fn encode(&self, e: &mut Encoder) {
        e.write_u64(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_v1(e);
        }
        self.miner_fee.encode(e);
        e.write_prefixed_bytes(&self.arbitrary_data);
    }
}

impl WireDecode for Transaction {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let len = d.read_len()?;
        let mut outputs = Vec::with_capacity(len);
        for _ in 0..len {
            outputs.push(Output::decode_v1(d)?);
        }
        let miner_fee = Currency::decode(d)?;
        let arbitrary_data = d.read_prefixed_bytes()?;
        Ok(Transaction {
            outputs,
            miner_fee,
            arbitrary_data,
        })
    }
}

/// A post-hardfork transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Transaction {
    pub outputs: Vec<Output>,
    pub miner_fee: Currency,
    pub arbitrary_data: Vec<u8>,
}

impl V2Transaction {
    pub fn txid(&self) -> TransactionId {
        let mut h = Sha256::new();
        h.update(TXN_V2_TAG);
        h.update(self.wire_bytes());
        TransactionId(Hash256(h.finalize().into()))
    }
}

impl WireEncode for V2Transaction {
    fn encode(&self, e: &mut Encoder) {
        e.write_u8(V2_VERSION_TAG);
        e.write_prefixed_bytes(&self.arbitrary_data);
        self.miner_fee.encode(e);
        e.write_u64(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_v2(e);
        }
    }
}

impl WireDecode for V2Transaction {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        read_v2_tag(d)?;
        let arbitrary_data = d.read_prefixed_bytes()?;
        let miner_fee = Currency::decode(d)?;
        let len = d.read_len()?;
        let mut outputs = Vec::with_capacity(len);
        for _ in 0..len {
            outputs.push(Output::decode_v2(d)?);
        }
        Ok(V2Transaction {
            outputs,
            miner_fee,
            arbitrary_data,
        })
    }
}

/// The proof-of-work surface of a block.
///
/// For V2 blocks the commitment field is the consensus commitment;
/// for V1 blocks it is the hash of the block contents. Either way the
/// block id is the hash of the header, so grinding the nonce is all a
/// miner does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_id: BlockId,
    pub nonce: u64,
    pub timestamp: u64,
    pub commitment: Hash256,
}

impl BlockHeader {
    pub fn id(&self) -> BlockId {
        let mut h = Sha256::new();
        h.update(BLOCK_ID_TAG);
        h.update(self.parent_id.0 .0);
        h.update(self.nonce.to_le_bytes());
        h.update(self.timestamp.to_le_bytes());
        h.update(self.commitment.0);
        BlockId(Hash256(h.finalize().into()))
    }
}

/// The V2 portion of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2BlockData {
    pub height: u64,
    pub commitment: Hash256,
    pub transactions: Vec<V2Transaction>,
}

/// A block in either layout. `v2` is present iff the block uses the
/// post-hardfork format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub parent_id: BlockId,
    pub nonce: u64,
    pub timestamp: u64,
    pub miner_payouts: Vec<Output>,
    pub transactions: Vec<Transaction>,
    pub v2: Option<V2BlockData>,
}

impl Block {
    /// The header whose hash is this block's id.
    pub fn header(&self) -> BlockHeader {
        let commitment = match &self.v2 {
            Some(v2) => v2.commitment,
            None => self.v1_content_hash(),
        };
        BlockHeader {
            parent_id: self.parent_id,
            nonce: self.nonce,
            timestamp: self.timestamp,
            commitment,
        }
    }

    pub fn id(&self) -> BlockId {
        self.header().id()
    }

    pub fn v2_transactions(&self) -> &[V2Transaction] {
        self.v2.as_ref().map_or(&[], |v2| v2.transactions.as_slice())
    }

    /// Hash binding a V1 block's payouts and transactions into its
    /// header.
    fn v1_content_hash(&self) -> Hash256 {
        let mut h = Sha256::new();
        h.update(V1_CONTENT_TAG);
        h.update((self.miner_payouts.len() as u64).to_le_bytes());
        for payout in &self.miner_payouts {
            h.update(payout.wire_bytes_for_version(1));
        }
        for txn in &self.transactions {
            h.update(txn.txid().0 .0);
        }
        Hash256(h.finalize().into())
    }

    fn encode_prelude(&self, e: &mut Encoder) {
        self.parent_id.encode(e);
        e.write_u64(self.nonce);
        e.write_u64(self.timestamp);
    }

    /// Encodes in the legacy layout. Any V2 data is ignored; callers
    /// pick the layout from the block's version.
    pub fn encode_v1(&self, e: &mut Encoder) {
        self.encode_prelude(e);
        e.write_u64(self.miner_payouts.len() as u64);
        for payout in &self.miner_payouts {
            payout.encode_v1(e);
        }
        e.write_u64(self.transactions.len() as u64);
        for txn in &self.transactions {
            txn.encode(e);
        }
    }

    pub fn decode_v1(d: &mut Decoder<'_>) -> Result<Block, DecodeError> {
        let parent_id = BlockId::decode(d)?;
        let nonce = d.read_u64()?;
        let timestamp = d.read_u64()?;
        let len = d.read_len()?;
        let mut miner_payouts = Vec::with_capacity(len);
        for _ in 0..len {
            miner_payouts.push(Output::decode_v1(d)?);
        }
        let len = d.read_len()?;
        let mut transactions = Vec::with_capacity(len);
        for _ in 0..len {
            transactions.push(Transaction::decode(d)?);
        }
        Ok(Block {
            parent_id,
            nonce,
            timestamp,
            miner_payouts,
            transactions,
            v2: None,
        })
    }

    /// Encodes in the post-hardfork layout: V1 transactions ride
    /// along, followed by the V2 block data.
    pub fn encode_v2(&self, e: &mut Encoder) {
        e.write_u8(V2_VERSION_TAG);
        self.encode_prelude(e);
        e.write_u64(self.miner_payouts.len() as u64);
        for payout in &self.miner_payouts {
            payout.encode_v2(e);
        }
        e.write_u64(self.transactions.len() as u64);
        for txn in &self.transactions {
            txn.encode(e);
        }
        let (height, commitment, v2_txns) = match &self.v2 {
            Some(v2) => (v2.height, v2.commitment, v2.transactions.as_slice()),
            None => (0, Hash256::ZERO, &[][..]),
        };
        e.write_u64(height);
        commitment.encode(e);
        e.write_u64(v2_txns.len() as u64);
        for txn in v2_txns {
            txn.encode(e);
        }
    }

    pub fn decode_v2(d: &mut Decoder<'_>) -> Result<Block, DecodeError> {
        read_v2_tag(d)?;
        let parent_id = BlockId::decode(d)?;
        let nonce = d.read_u64()?;
        let timestamp = d.read_u64()?;
        let len = d.read_len()?;
        let mut miner_payouts = Vec::with_capacity(len);
        for _ in 0..len {
            miner_payouts.push(Output::decode_v2(d)?);
        }
        let len = d.read_len()?;
        let mut transactions = Vec::with_capacity(len);
        for _ in 0..len {
            transactions.push(Transaction::decode(d)?);
        }
        let height = d.read_u64()?;
        let commitment = Hash256::decode(d)?;
        let len = d.read_len()?;
        let mut v2_transactions = Vec::with_capacity(len);
        for _ in 0..len {
            v2_transactions.push(V2Transaction::decode(d)?);
        }
        Ok(Block {
            parent_id,
            nonce,
            timestamp,
            miner_payouts,
            transactions,
            v2: Some(V2BlockData {
                height,
                commitment,
                transactions: v2_transactions,
            }),
        })
    }

    pub fn v1_wire_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode_v1(&mut e);
        e.finish()
    }

    pub fn v2_wire_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode_v2(&mut e);
        e.finish()
    }

    /// Decodes a legacy block spanning the whole input.
    pub fn from_v1_wire_bytes(buf: &[u8]) -> Result<Block, DecodeError> {
        let mut d = Decoder::new(buf);
        let b = Block::decode_v1(&mut d)?;
        d.finish()?;
        Ok(b)
    }

    /// Decodes a post-hardfork block spanning the whole input.
    pub fn from_v2_wire_bytes(buf: &[u8]) -> Result<Block, DecodeError> {
        let mut d = Decoder::new(buf);
        let b = Block::decode_v2(&mut d)?;
        d.finish()?;
        Ok(b)
    }
}

/// One entry of a [`V2BlockOutline`]: a transaction body, or just an
/// id when the receiving peer is expected to have the body pooled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutlineTransaction {
    PoolV1(TransactionId),
    PoolV2(TransactionId),
    V1(Transaction),
    V2(V2Transaction),
}

/// The compact gossip form of a V2 block: header fields plus a
/// transaction list in which bodies already present in the local
/// pools are replaced by their ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2BlockOutline {
    pub height: u64,
    pub parent_id: BlockId,
    pub nonce: u64,
    pub timestamp: u64,
    pub commitment: Hash256,
    pub transactions: Vec<OutlineTransaction>,
}

impl V2BlockOutline {
    /// Builds the outline for a V2 block. Returns `None` for blocks
    /// without V2 data, which gossip as bare headers instead.
    pub fn from_block(
        block: &Block,
        v1_pool: &[Transaction],
        v2_pool: &[V2Transaction],
    ) -> Option<V2BlockOutline> {
        let v2 = block.v2.as_ref()?;
        let pooled_v1: HashSet<TransactionId> = v1_pool.iter().map(Transaction::txid).collect();
        let pooled_v2: HashSet<TransactionId> = v2_pool.iter().map(V2Transaction::txid).collect();

        let mut transactions = Vec::with_capacity(block.transactions.len() + v2.transactions.len());
        for txn in &block.transactions {
            let txid = txn.txid();
            if pooled_v1.contains(&txid) {
                transactions.push(OutlineTransaction::PoolV1(txid));
            } else {
                transactions.push(OutlineTransaction::V1(txn.clone()));
            }
        }
        for txn in &v2.transactions {
            let txid = txn.txid();
            if pooled_v2.contains(&txid) {
                transactions.push(OutlineTransaction::PoolV2(txid));
            } else {
                transactions.push(OutlineTransaction::V2(txn.clone()));
            }
        }

        Some(V2BlockOutline {
            height: v2.height,
            parent_id: block.parent_id,
            nonce: block.nonce,
            timestamp: block.timestamp,
            commitment: v2.commitment,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> Output {
        Output {
            value: Currency(1_000),
            address: Address(Hash256([0x11; 32])),
        }
    }

    fn sample_v1_txn() -> Transaction {
        Transaction {
            outputs: vec![sample_output()],
            miner_fee: Currency(25),
            arbitrary_data: b"v1".to_vec(),
        }
    }

    fn sample_v2_txn() -> V2Transaction {
        V2Transaction {
            outputs: vec![sample_output()],
            miner_fee: Currency(30),
            arbitrary_data: b"v2".to_vec(),
        }
    }

    #[test]
    fn txids_are_domain_separated() {
        // Same field values, different formats: the ids must differ.
        let v1 = sample_v1_txn();
        let v2 = V2Transaction {
            outputs: v1.outputs.clone(),
            miner_fee: v1.miner_fee,
            arbitrary_data: v1.arbitrary_data.clone(),
        };
        assert_ne!(v1.txid(), v2.txid());
    }

    #[test]
    fn block_id_covers_nonce_and_contents() {
        let mut b = Block {
            parent_id: BlockId(Hash256([1; 32])),
            nonce: 0,
            timestamp: 1_000,
            miner_payouts: vec![sample_output()],
            transactions: vec![sample_v1_txn()],
            v2: None,
        };
        let id = b.id();
        b.nonce = 1;
        assert_ne!(b.id(), id);
        b.nonce = 0;
        b.transactions.clear();
        assert_ne!(b.id(), id);
    }

    #[test]
    fn v1_block_wire_round_trip() {
        let b = Block {
            parent_id: BlockId(Hash256([2; 32])),
            nonce: 42,
            timestamp: 1_234,
            miner_payouts: vec![sample_output()],
            transactions: vec![sample_v1_txn()],
            v2: None,
        };
        let buf = b.v1_wire_bytes();
        assert_eq!(Block::from_v1_wire_bytes(&buf).unwrap(), b);

        // Truncation and trailing garbage are both rejected.
        assert!(Block::from_v1_wire_bytes(&buf[..buf.len() - 1]).is_err());
        let mut long = buf.clone();
        long.push(0);
        assert_eq!(
            Block::from_v1_wire_bytes(&long),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn v2_block_wire_round_trip() {
        let b = Block {
            parent_id: BlockId(Hash256([3; 32])),
            nonce: 7,
            timestamp: 5_678,
            miner_payouts: vec![sample_output()],
            transactions: vec![sample_v1_txn()],
            v2: Some(V2BlockData {
                height: 12,
                commitment: Hash256([9; 32]),
                transactions: vec![sample_v2_txn()],
            }),
        };
        let buf = b.v2_wire_bytes();
        assert_eq!(Block::from_v2_wire_bytes(&buf).unwrap(), b);

        // A V1 decoder must not accept the V2 layout.
        assert!(Block::from_v1_wire_bytes(&buf).is_err());
    }

    #[test]
    fn outline_replaces_pooled_bodies_with_ids() {
        let pooled = sample_v2_txn();
        let unpooled = V2Transaction {
            arbitrary_data: b"not pooled".to_vec(),
            ..sample_v2_txn()
        };
        let b = Block {
            parent_id: BlockId(Hash256([4; 32])),
            nonce: 0,
            timestamp: 0,
            miner_payouts: vec![sample_output()],
            transactions: vec![],
            v2: Some(V2BlockData {
                height: 3,
                commitment: Hash256([5; 32]),
                transactions: vec![pooled.clone(), unpooled.clone()],
            }),
        };
        let outline =
            V2BlockOutline::from_block(&b, &[], std::slice::from_ref(&pooled)).unwrap();
        assert_eq!(outline.commitment, Hash256([5; 32]));
        assert_eq!(
            outline.transactions,
            vec![
                OutlineTransaction::PoolV2(pooled.txid()),
                OutlineTransaction::V2(unpooled),
            ]
        );

        let v1_only = Block { v2: None, ..b };
        assert!(V2BlockOutline::from_block(&v1_only, &[], &[]).is_none());
    }
}
