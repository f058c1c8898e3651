//! Core chain primitives.
//!
//! Everything here is a small value type: 32-byte hashes and the
//! newtypes layered on them, currency amounts, and the chain index
//! pairing a height with a block id. Wire layouts live in
//! [`encoding`] and [`block`].

pub mod block;
pub mod encoding;

pub use block::{
    Block, BlockHeader, Output, OutlineTransaction, Transaction, V2BlockData, V2BlockOutline,
    V2Transaction,
};

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error parsing a hex-encoded hash, id, or address.
#[derive(Debug, Error)]
pub enum ParseHashError {
    #[error("expected 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 256-bit hash, displayed and serialized as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Hash256 = Hash256([0; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseHashError::WrongLength(s.len()));
        }
        let mut buf = [0; 32];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Hash256(buf))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Hash256);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ParseHashError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.parse()?))
            }
        }
    };
}

hash_newtype! {
    /// Identifies a block. The id doubles as the proof-of-work
    /// surface: interpreted as a big-endian 256-bit integer, it must
    /// not exceed the network target.
    BlockId
}

hash_newtype! {
    /// Identifies a transaction, in either wire format.
    TransactionId
}

hash_newtype! {
    /// A payout destination.
    Address
}

impl BlockId {
    /// Whether this id satisfies the given proof-of-work target.
    pub fn meets_target(&self, target: &Hash256) -> bool {
        self.0 .0 <= target.0
    }
}

impl Address {
    /// The canonical all-zero destination, used as a sentinel for
    /// "no payout configured".
    pub const VOID: Address = Address(Hash256::ZERO);
}

/// An amount of the native currency, in base units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Currency(pub u64);

impl Currency {
    pub const ZERO: Currency = Currency(0);
}

impl Add for Currency {
    type Output = Currency;

    fn add(self, rhs: Currency) -> Currency {
        Currency(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Currency {
    fn add_assign(&mut self, rhs: Currency) {
        *self = *self + rhs;
    }
}

impl Sum for Currency {
    fn sum<I: Iterator<Item = Currency>>(iter: I) -> Currency {
        iter.fold(Currency::ZERO, Add::add)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A height paired with the id of the block at that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainIndex {
    pub height: u64,
    pub id: BlockId,
}

impl fmt::Display for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.height, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let h = Hash256(bytes);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab"));
        assert_eq!(s.parse::<Hash256>().unwrap(), h);
    }

    #[test]
    fn hash_rejects_bad_literals() {
        assert!(matches!(
            "abcd".parse::<Hash256>(),
            Err(ParseHashError::WrongLength(4))
        ));
        let bad = "zz".repeat(32);
        assert!(matches!(
            bad.parse::<Hash256>(),
            Err(ParseHashError::InvalidHex(_))
        ));
    }

    #[test]
    fn block_id_target_comparison() {
        let target = Hash256([0x0f; 32]);
        assert!(BlockId(Hash256::ZERO).meets_target(&target));
        assert!(BlockId(target).meets_target(&target));
        assert!(!BlockId(Hash256([0x10; 32])).meets_target(&target));
    }

    #[test]
    fn void_address_is_all_zero() {
        assert_eq!(Address::VOID.0, Hash256::ZERO);
        assert_eq!(
            Address::VOID.to_string().parse::<Address>().unwrap(),
            Address::VOID
        );
    }

    #[test]
    fn currency_sum_saturates() {
        let total: Currency = [Currency(u64::MAX), Currency(1)].into_iter().sum();
        assert_eq!(total, Currency(u64::MAX));
    }
}
