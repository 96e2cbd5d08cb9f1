//! Binary codec for network message serialization.
//!
//! Centralizes the bincode configuration so every message crosses the wire
//! in the same shape: fixed-size integers, big-endian byte order. Fixed-size
//! encoding keeps message sizes deterministic, which the input delta
//! compression relies on.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-int + big-endian: deterministic sizes, network byte order.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque (they only expose `Display`), so the underlying
/// reason is preserved as a message string. Codec failures are exceptional
/// conditions (corrupted datagrams, protocol mismatch), not hot-path events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The encoding operation failed.
    Encode {
        /// The underlying bincode error message.
        message: String,
    },
    /// The decoding operation failed.
    Decode {
        /// The underlying bincode error message.
        message: String,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "encoding failed: {}", message),
            Self::Decode { message } => write!(f, "decoding failed: {}", message),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for crate::TransportError {
    fn from(err: CodecError) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}

/// Encodes a serializable value into a fresh byte vector.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Decodes a value from a byte slice, returning it together with the number
/// of bytes read.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), CodecError> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

/// The encoded size of a value, in bytes.
///
/// With fixed-int encoding this is constant per type for flat types, which
/// is how per-player input payload sizes are derived.
pub fn encoded_len<T: Serialize>(value: &T) -> Result<usize, CodecError> {
    encode(value).map(|bytes| bytes.len())
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod codec_tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let value: u32 = 0xDEADBEEF;
        let encoded = encode(&value).unwrap();
        let (decoded, read): (u32, _) = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(read, encoded.len());
    }

    #[test]
    fn test_big_endian_on_the_wire() {
        let encoded = encode(&0x0102_0304u32).unwrap();
        assert_eq!(encoded, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_fixed_int_sizes_are_stable() {
        assert_eq!(encoded_len(&0u16).unwrap(), 2);
        assert_eq!(encoded_len(&u16::MAX).unwrap(), 2);
        assert_eq!(encoded_len(&0i32).unwrap(), 4);
        assert_eq!(encoded_len(&i32::MIN).unwrap(), 4);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let encoded = encode(&0x11223344u32).unwrap();
        let result: Result<(u32, _), _> = decode(&encoded[..2]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_error_display() {
        let result: Result<(u64, _), _> = decode(&[0u8; 2]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("decoding failed"));
    }
}
