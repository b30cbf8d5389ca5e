// WIRE CODEC
// Canonical byte encoding for blocks, transactions, coins and store records.
//
// INVARIANTS:
// 1. Fixed-width little-endian integers, u64 length prefixes
// 2. decode(encode(x)) == x and encode(decode(b)) == b for every accepted b
// 3. Trailing bytes are a decode error (no two encodings of one value)

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Upper bound on any single decoded object (matches the max block size).
pub const MAX_DECODE_BYTES: u64 = 4_000_000;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_DECODE_BYTES)
        .reject_trailing_bytes()
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    options()
        .serialize(value)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options()
        .deserialize(bytes)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Serialized length without allocating the buffer.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> u64 {
    options().serialized_size(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&(7u32, vec![1u8, 2, 3])).unwrap();
        assert_eq!(decode::<(u32, Vec<u8>)>(&bytes).unwrap(), (7, vec![1, 2, 3]));
        bytes.push(0);
        assert!(decode::<(u32, Vec<u8>)>(&bytes).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = encode(&(7u32, vec![1u8, 2, 3])).unwrap();
        assert!(decode::<(u32, Vec<u8>)>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_encoded_len_matches() {
        let v = vec![9u8; 10];
        assert_eq!(encoded_len(&v), encode(&v).unwrap().len() as u64);
        // u64 length prefix plus payload.
        assert_eq!(encoded_len(&v), 18);
    }
}
