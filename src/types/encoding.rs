//! Deterministic wire codec.
//!
//! Template `data` fields and `submitblock` payloads carry the binary
//! wire form of transactions and blocks, transported as hex. The
//! codec is little-endian with u64 length prefixes; decoding is
//! cursor-based over a byte slice and fails on truncation, oversized
//! length prefixes, and trailing garbage.

use thiserror::Error;

use super::{Address, BlockId, Currency, Hash256, TransactionId};

/// Error decoding a wire-encoded value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("length prefix {0} exceeds remaining input")]
    LengthOverflow(u64),
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("invalid version tag {0:#04x}")]
    InvalidVersionTag(u8),
}

/// Appends wire-encoded values to a byte buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes a u64 length prefix followed by the bytes themselves.
    pub fn write_prefixed_bytes(&mut self, v: &[u8]) {
        self.write_u64(v.len() as u64);
        self.write_bytes(v);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes wire-encoded values from a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut bytes = [0; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub fn read_prefixed_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u64()?;
        if len > self.buf.len() as u64 {
            return Err(DecodeError::LengthOverflow(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Reads an element-count prefix, rejecting counts that cannot
    /// possibly fit in the remaining input. Each element occupies at
    /// least one byte, so `remaining()` is a safe upper bound.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_u64()?;
        if len > self.buf.len() as u64 {
            return Err(DecodeError::LengthOverflow(len));
        }
        Ok(len as usize)
    }

    /// Asserts the input was consumed exactly.
    pub fn finish(self) -> Result<(), DecodeError> {
        if !self.buf.is_empty() {
            return Err(DecodeError::TrailingBytes(self.buf.len()));
        }
        Ok(())
    }
}

/// A type with a deterministic wire layout.
pub trait WireEncode {
    fn encode(&self, e: &mut Encoder);

    fn wire_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode(&mut e);
        e.finish()
    }
}

/// A type decodable from its wire layout.
pub trait WireDecode: Sized {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    /// Decodes a value that must span the whole input.
    fn from_wire_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut d = Decoder::new(buf);
        let v = Self::decode(&mut d)?;
        d.finish()?;
        Ok(v)
    }
}

impl WireEncode for Hash256 {
    fn encode(&self, e: &mut Encoder) {
        e.write_bytes(&self.0);
    }
}

impl WireDecode for Hash256 {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Hash256(d.read_array()?))
    }
}

impl WireEncode for BlockId {
    fn encode(&self, e: &mut Encoder) {
        self.0.encode(e);
    }
}

impl WireDecode for BlockId {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(BlockId(Hash256::decode(d)?))
    }
}

impl WireEncode for TransactionId {
    fn encode(&self, e: &mut Encoder) {
        self.0.encode(e);
    }
}

impl WireDecode for TransactionId {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(TransactionId(Hash256::decode(d)?))
    }
}

impl WireEncode for Address {
    fn encode(&self, e: &mut Encoder) {
        self.0.encode(e);
    }
}

impl WireDecode for Address {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Address(Hash256::decode(d)?))
    }
}

impl WireEncode for Currency {
    fn encode(&self, e: &mut Encoder) {
        e.write_u64(self.0);
    }
}

impl WireDecode for Currency {
    fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Currency(d.read_u64()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_input_fails() {
        let mut d = Decoder::new(&[1, 2, 3]);
        assert_eq!(d.read_u64(), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn oversized_length_prefix_fails() {
        let mut e = Encoder::new();
        e.write_u64(u64::MAX);
        let buf = e.finish();
        let mut d = Decoder::new(&buf);
        assert!(matches!(
            d.read_prefixed_bytes(),
            Err(DecodeError::LengthOverflow(_))
        ));
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut e = Encoder::new();
        Currency(7).encode(&mut e);
        let mut buf = e.finish();
        buf.push(0);
        assert_eq!(
            Currency::from_wire_bytes(&buf),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn prefixed_bytes_round_trip() {
        let mut e = Encoder::new();
        e.write_prefixed_bytes(b"arbitrary");
        let buf = e.finish();
        let mut d = Decoder::new(&buf);
        assert_eq!(d.read_prefixed_bytes().unwrap(), b"arbitrary");
        assert!(d.finish().is_ok());
    }
}
