//! Canonical deterministic serialization
//!
//! Message digests and the persistence files use one encoding: fixed-width
//! integers in little-endian, variable-length sequences as
//! `uvarint(len) || elements`, compound records as field concatenation in
//! declaration order. There is exactly one byte representation for any
//! value, so digests are stable across processes.

use crate::types::{BlockId, ChainId, PublicKey};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("invalid option tag {0:#04x}")]
    InvalidOptionTag(u8),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("length {0} exceeds remaining input")]
    LengthOutOfBounds(u64),
    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),
}

/// Encode u64 as LEB128 varint.
pub fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a LEB128 varint, advancing the input slice.
pub fn read_uvarint(input: &mut &[u8]) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input.split_first().ok_or(CodecError::UnexpectedEof)?;
        *input = rest;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(CodecError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::UnexpectedEof);
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

pub trait CanonicalEncode {
    fn encode(&self, out: &mut Vec<u8>);

    fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

pub trait CanonicalDecode: Sized {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError>;

    /// Decode a value that must consume the whole input.
    fn decode_all(mut input: &[u8]) -> Result<Self, CodecError> {
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }
        Ok(value)
    }
}

macro_rules! impl_le_int {
    ($($ty:ty),*) => {$(
        impl CanonicalEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl CanonicalDecode for $ty {
            fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
                let bytes = take(input, std::mem::size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
            }
        }
    )*};
}

impl_le_int!(u8, u16, u32, u64);

impl CanonicalEncode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl CanonicalDecode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl CanonicalEncode for [u8; 32] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl CanonicalDecode for [u8; 32] {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let bytes = take(input, 32)?;
        Ok(bytes.try_into().unwrap())
    }
}

impl CanonicalEncode for BlockId {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

impl CanonicalDecode for BlockId {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(BlockId(<[u8; 32]>::decode(input)?))
    }
}

impl CanonicalEncode for PublicKey {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

impl CanonicalDecode for PublicKey {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(PublicKey(<[u8; 32]>::decode(input)?))
    }
}

impl CanonicalEncode for ChainId {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

impl CanonicalDecode for ChainId {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(ChainId(<[u8; 32]>::decode(input)?))
    }
}

/// Byte strings: `uvarint(len) || bytes`.
impl CanonicalEncode for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_uvarint(self.len() as u64, out);
        out.extend_from_slice(self);
    }
}

impl CanonicalDecode for Vec<u8> {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let len = read_uvarint(input)?;
        if len > input.len() as u64 {
            return Err(CodecError::LengthOutOfBounds(len));
        }
        Ok(take(input, len as usize)?.to_vec())
    }
}

impl CanonicalEncode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        write_uvarint(self.len() as u64, out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl CanonicalDecode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let bytes = Vec::<u8>::decode(input)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<T: CanonicalEncode> CanonicalEncode for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            None => out.push(0),
            Some(value) => {
                out.push(1);
                value.encode(out);
            }
        }
    }
}

impl<T: CanonicalDecode> CanonicalDecode for Option<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        match u8::decode(input)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(input)?)),
            other => Err(CodecError::InvalidOptionTag(other)),
        }
    }
}

/// Generic sequences: `uvarint(len) || elements`. `Vec<u8>` has its own
/// compact impl above, so this one lives on a wrapper-free helper pair to
/// avoid overlapping impls.
pub fn encode_seq<T: CanonicalEncode>(items: &[T], out: &mut Vec<u8>) {
    write_uvarint(items.len() as u64, out);
    for item in items {
        item.encode(out);
    }
}

pub fn decode_seq<T: CanonicalDecode>(input: &mut &[u8]) -> Result<Vec<T>, CodecError> {
    let len = read_uvarint(input)?;
    // Each element takes at least one byte; bail before allocating on junk.
    if len > input.len() as u64 {
        return Err(CodecError::LengthOutOfBounds(len));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(T::decode(input)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvarint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(value, &mut buf);
            let mut input = buf.as_slice();
            assert_eq!(read_uvarint(&mut input).unwrap(), value);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn uvarint_truncated_fails() {
        let mut input: &[u8] = &[0x80, 0x80];
        assert_eq!(read_uvarint(&mut input), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn ints_are_little_endian() {
        assert_eq!(0x0102_0304u32.encoded(), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn bool_rejects_junk() {
        assert_eq!(bool::decode_all(&[2]), Err(CodecError::InvalidBool(2)));
    }

    #[test]
    fn option_round_trip() {
        let some: Option<u32> = Some(9);
        let none: Option<u32> = None;
        assert_eq!(Option::<u32>::decode_all(&some.encoded()).unwrap(), some);
        assert_eq!(Option::<u32>::decode_all(&none.encoded()).unwrap(), none);
    }

    #[test]
    fn seq_round_trip() {
        let items = vec![1u32, 2, 3];
        let mut out = Vec::new();
        encode_seq(&items, &mut out);
        let mut input = out.as_slice();
        assert_eq!(decode_seq::<u32>(&mut input).unwrap(), items);
        assert!(input.is_empty());
    }

    #[test]
    fn decode_all_rejects_trailing() {
        let mut buf = 7u32.encoded();
        buf.push(0);
        assert_eq!(u32::decode_all(&buf), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn oversized_length_rejected_before_alloc() {
        let mut buf = Vec::new();
        write_uvarint(u64::MAX, &mut buf);
        let mut input = buf.as_slice();
        assert!(matches!(
            decode_seq::<u32>(&mut input),
            Err(CodecError::LengthOutOfBounds(_))
        ));
    }
}
