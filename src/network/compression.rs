//! Input compression for the wire: XOR delta encoding against the last
//! acknowledged input, followed by a bitfield run-length encoding.
//!
//! Held inputs barely change frame to frame, so the XOR pass produces long
//! runs of zero bytes which the RLE pass collapses. The RLE format is a
//! series of sequences, each prefixed with a LEB128 varint header:
//!
//! - compressed run of a fill byte: `varint(len << 2 | bit << 1 | 1)` where
//!   `bit` selects `0x00` or `0xFF`;
//! - literal sequence: `varint(len << 1)` followed by `len` raw bytes.

use std::fmt;

/// Error type for RLE decode failures (corrupted or truncated payloads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RleDecodeError {
    /// What was wrong with the payload.
    pub reason: &'static str,
}

impl fmt::Display for RleDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RLE decode failed: {}", self.reason)
    }
}

impl std::error::Error for RleDecodeError {}

/// Delta-encodes pending inputs against a reference input and RLE-compresses
/// the result.
pub(crate) fn encode<'a>(
    reference: &[u8],
    pending_inputs: impl Iterator<Item = &'a Vec<u8>>,
) -> Vec<u8> {
    // XOR each input against the reference (mostly zero bits in sequence),
    // then collapse the zero runs.
    let buf = delta_encode(reference, pending_inputs);
    rle_encode(&buf)
}

/// Reverses [`encode`], producing one byte buffer per transmitted input.
pub(crate) fn decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, RleDecodeError> {
    let buf = rle_decode(data)?;
    if reference.is_empty() || buf.len() % reference.len() != 0 {
        return Err(RleDecodeError {
            reason: "payload length is not a multiple of the input size",
        });
    }
    Ok(delta_decode(reference, &buf))
}

pub(crate) fn delta_encode<'a>(
    ref_bytes: &[u8],
    pending_inputs: impl Iterator<Item = &'a Vec<u8>>,
) -> Vec<u8> {
    let (lower, upper) = pending_inputs.size_hint();
    let mut bytes = Vec::with_capacity(upper.unwrap_or(lower) * ref_bytes.len());

    for input in pending_inputs {
        debug_assert_eq!(input.len(), ref_bytes.len());
        for (b1, b2) in ref_bytes.iter().zip(input.iter()) {
            bytes.push(b1 ^ b2);
        }
    }
    bytes
}

pub(crate) fn delta_decode(ref_bytes: &[u8], data: &[u8]) -> Vec<Vec<u8>> {
    let out_size = data.len() / ref_bytes.len();
    let mut output = Vec::with_capacity(out_size);

    for chunk in data.chunks_exact(ref_bytes.len()) {
        output.push(
            ref_bytes
                .iter()
                .zip(chunk.iter())
                .map(|(r, d)| r ^ d)
                .collect(),
        );
    }
    output
}

// LEB128 varints for the sequence headers.
fn varint_push(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn varint_read(buf: &[u8], offset: &mut usize) -> Result<u64, RleDecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*offset).ok_or(RleDecodeError {
            reason: "truncated varint",
        })?;
        *offset += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(RleDecodeError {
                reason: "varint overflow",
            });
        }
    }
}

fn flush_literal(out: &mut Vec<u8>, literal: &mut Vec<u8>) {
    if literal.is_empty() {
        return;
    }
    varint_push((literal.len() as u64) << 1, out);
    out.append(literal);
}

pub(crate) fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        if byte == 0x00 || byte == 0xFF {
            let mut run = 1;
            while i + run < data.len() && data[i + run] == byte {
                run += 1;
            }
            // short runs compress worse than a literal (header ≥ 1 byte)
            if run >= 2 {
                flush_literal(&mut out, &mut literal);
                let bit = u64::from(byte == 0xFF);
                varint_push((run as u64) << 2 | bit << 1 | 1, &mut out);
                i += run;
                continue;
            }
        }
        literal.push(byte);
        i += 1;
    }
    flush_literal(&mut out, &mut literal);
    out
}

pub(crate) fn rle_decode(data: &[u8]) -> Result<Vec<u8>, RleDecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let header = varint_read(data, &mut offset)?;
        if header & 1 == 1 {
            // compressed run of a fill byte
            let fill = if header & 2 == 2 { 0xFF } else { 0x00 };
            let len = usize::try_from(header >> 2).map_err(|_| RleDecodeError {
                reason: "run length exceeds address space",
            })?;
            if len > MAX_DECODED_LEN.saturating_sub(out.len()) {
                return Err(RleDecodeError {
                    reason: "run length exceeds the decode limit",
                });
            }
            out.resize(out.len() + len, fill);
        } else {
            let len = usize::try_from(header >> 1).map_err(|_| RleDecodeError {
                reason: "literal length exceeds address space",
            })?;
            let end = offset.checked_add(len).ok_or(RleDecodeError {
                reason: "literal length overflow",
            })?;
            if end > data.len() {
                return Err(RleDecodeError {
                    reason: "truncated literal sequence",
                });
            }
            out.extend_from_slice(&data[offset..end]);
            offset = end;
        }
    }
    Ok(out)
}

/// Upper bound on a decoded payload; real input batches are far below this,
/// so anything bigger is a corrupted or hostile packet.
const MAX_DECODED_LEN: usize = 1 << 20;

// #########
// # TESTS #
// #########

#[cfg(test)]
mod compression_tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let ref_input = vec![0, 0, 0, 1];
        let inp0: Vec<u8> = vec![0, 0, 1, 0];
        let inp1: Vec<u8> = vec![0, 0, 1, 1];
        let inp2: Vec<u8> = vec![0, 1, 0, 0];
        let inp3: Vec<u8> = vec![0, 1, 0, 1];
        let inp4: Vec<u8> = vec![0, 1, 1, 0];

        let pend_inp = vec![inp0, inp1, inp2, inp3, inp4];

        let encoded = encode(&ref_input, pend_inp.iter());
        let decoded = decode(&ref_input, &encoded).unwrap();

        assert!(pend_inp == decoded);
    }

    #[test]
    fn test_encode_decode_empty() {
        let ref_input = vec![0, 0, 0, 0];
        let pend_inp: Vec<Vec<u8>> = vec![];

        let encoded = encode(&ref_input, pend_inp.iter());
        let decoded = decode(&ref_input, &encoded).unwrap();

        assert!(decoded.is_empty());
    }

    #[test]
    fn test_identical_inputs_compress_tightly() {
        let ref_input = vec![7u8; 16];
        let pending = vec![ref_input.clone(); 32];

        let encoded = encode(&ref_input, pending.iter());
        // 512 zero bytes collapse into a couple of header bytes
        assert!(encoded.len() < 8);
        assert_eq!(decode(&ref_input, &encoded).unwrap(), pending);
    }

    #[test]
    fn test_delta_encode_xor_property() {
        let ref_bytes = vec![0xFF, 0xAA, 0x55];
        let inputs = [vec![0xFF, 0xAA, 0x55]];

        let encoded = delta_encode(&ref_bytes, inputs.iter());
        assert!(encoded.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rle_round_trip_mixed() {
        let data = vec![0, 0, 0, 0, 255, 255, 1, 2, 3, 0, 255];
        let encoded = rle_encode(&data);
        assert_eq!(rle_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_rle_decode_truncated() {
        let data = vec![0u8; 64];
        let mut encoded = rle_encode(&data);
        encoded.pop();
        // either a truncated varint or a short run; both must error or
        // produce a different payload, never panic
        let _ = rle_decode(&encoded);
    }

    #[test]
    fn test_decode_wrong_size_fails() {
        let ref_input = vec![0u8; 4];
        let inputs = vec![vec![1u8, 2, 3, 4]];
        let encoded = encode(&ref_input, inputs.iter());
        // decoding against a reference of mismatched size must fail cleanly
        let bad_ref = vec![0u8; 3];
        assert!(decode(&bad_ref, &encoded).is_err());
    }

    #[test]
    fn test_decode_hostile_run_length() {
        // varint claiming an enormous run must be rejected, not allocated
        let mut payload = Vec::new();
        super::varint_push((u64::MAX >> 2) << 2 | 1, &mut payload);
        assert!(rle_decode(&payload).is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// encode followed by decode is identity
        #[test]
        fn prop_encode_decode_roundtrip(
            ref_input in proptest::collection::vec(any::<u8>(), 1..=32),
            count in 1usize..=16,
        ) {
            let size = ref_input.len();
            let pend_inp: Vec<Vec<u8>> = (0..count)
                .map(|i| (0..size).map(|j| (i * 31 + j * 7) as u8).collect())
                .collect();

            let encoded = encode(&ref_input, pend_inp.iter());
            let decoded = decode(&ref_input, &encoded).expect("decode should succeed");
            prop_assert_eq!(decoded, pend_inp);
        }

        /// RLE encode/decode round-trips arbitrary payloads
        #[test]
        fn prop_rle_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = rle_encode(&data);
            let decoded = rle_decode(&encoded).expect("decode should succeed");
            prop_assert_eq!(decoded, data);
        }

        /// decoding never panics on arbitrary bytes
        #[test]
        fn prop_rle_decode_garbage_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = rle_decode(&data);
        }

        /// encoding is deterministic
        #[test]
        fn prop_encoding_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(rle_encode(&data), rle_encode(&data));
        }
    }
}
