//! Byte ↔ text transcoding for text-framed transports.
//!
//! The wire protocol is UTF-8 JSON; binary CRDT update and snapshot payloads
//! are carried as base64 text inside a JSON field. `encode`/`decode` must be
//! exact inverses for arbitrary byte sequences up to the protocol's
//! `maxUpdateSize` (property P3 in the specification).
//!
//! Encoding chunks its input into 32 KiB blocks before folding into the
//! base64 engine so that no single intermediate allocation scales with the
//! whole payload at once — the analogue of the teacher's streaming
//! compression helpers in `compression::streaming`, generalized here to a
//! fixed chunk size rather than an adaptive one since base64 has no internal
//! state to carry across chunks.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Chunk size used when encoding, in bytes. Keeping this bounded means the
/// encoder never needs to hold an argument or intermediate buffer that scales
/// with the full payload size in one shot.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Errors from the encoding module.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    /// The input could not be decoded as valid base64.
    #[error("invalid base64 input: {0}")]
    InvalidBase64(String),

    /// The encoding facility is unavailable on this runtime.
    #[error("encoding unavailable")]
    EncodingUnavailable,
}

/// Result alias for the encoding module.
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Encode arbitrary bytes to a base64 string, chunked internally.
///
/// The output is the concatenation of each chunk's base64 encoding, which is
/// valid because base64 encodes fixed-size byte groups independently of
/// surrounding chunks only when each chunk's length is a multiple of 3 bytes
/// — we enforce that by only allowing the final chunk to be short.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in aligned_chunks(bytes, CHUNK_SIZE) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Decode a base64 string back to bytes.
///
/// Returns `EncodingError::InvalidBase64` if the string is not valid base64.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| EncodingError::InvalidBase64(e.to_string()))
}

/// Split `bytes` into chunks of at most `size` bytes, with every chunk but
/// the last aligned to a multiple of 3 so that concatenating the base64
/// encoding of each chunk equals the base64 encoding of the whole.
fn aligned_chunks(bytes: &[u8], size: usize) -> impl Iterator<Item = &[u8]> {
    let aligned = size - (size % 3);
    let aligned = if aligned == 0 { 3 } else { aligned };
    bytes.chunks(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty() {
        assert_eq!(decode(&encode(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn round_trip_small() {
        let data = b"hello world".to_vec();
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn round_trip_large_spans_multiple_chunks() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 256) as u8).collect();
        let encoded = encode(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn round_trip_matches_unchunked_reference() {
        let data: Vec<u8> = (0..10_000).map(|i| (i * 7 % 256) as u8).collect();
        let chunked = encode(&data);
        let reference = STANDARD.encode(&data);
        assert_eq!(chunked, reference);
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        assert!(decode("not valid base64 !!!").is_err());
    }

    #[test]
    fn every_byte_value_round_trips() {
        let data: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    proptest::proptest! {
        #[test]
        fn encode_decode_is_an_exact_inverse_for_any_byte_sequence(data: Vec<u8>) {
            proptest::prop_assert_eq!(decode(&encode(&data)).unwrap(), data);
        }

        #[test]
        fn encode_never_panics_on_arbitrary_byte_sequences(data: Vec<u8>) {
            let _ = encode(&data);
        }
    }
}
