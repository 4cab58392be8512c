//! Self-describing binary frame for IPC with child processes (spec §4.7).
//!
//! ```text
//! bytes 0..3    magic 'E','B','F','1'
//! bytes 4..7    metadata length, big-endian u32
//! bytes 8..11   payload length, big-endian u32
//! bytes 12..    metadata segment
//! then          payload
//! ```
//!
//! Metadata segment: `key<US>value` pairs joined by `<RS>` (0x1F / 0x1E),
//! keys sorted ascending for deterministic encoding.

use std::collections::BTreeMap;
use std::io::Read;

use thiserror::Error;

const MAGIC: &[u8; 4] = b"EBF1";
const HEADER_LEN: usize = 12;
const UNIT_SEPARATOR: u8 = 0x1F;
const RECORD_SEPARATOR: u8 = 0x1E;

/// Frame codec failure kinds (spec §4.7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too small: {0} bytes, need at least {HEADER_LEN}")]
    FrameTooSmall(usize),
    #[error("invalid marker")]
    InvalidMarker,
    #[error("segment too large: {0} exceeds platform maximum")]
    SegmentTooLarge(u64),
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("malformed metadata: missing unit separator in pair {0:?}")]
    MalformedMetadata(Vec<u8>),
    #[error("EOF")]
    Eof,
    #[error("read header error: {0}")]
    ReadHeaderError(String),
}

/// Encode metadata + payload into one frame.
pub fn encode(metadata: &BTreeMap<String, String>, payload: &[u8]) -> Vec<u8> {
    let metadata_bytes = encode_metadata(metadata);
    let mut out = Vec::with_capacity(HEADER_LEN + metadata_bytes.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(metadata_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&metadata_bytes);
    out.extend_from_slice(payload);
    out
}

fn encode_metadata(metadata: &BTreeMap<String, String>) -> Vec<u8> {
    // BTreeMap already iterates in ascending key order.
    let mut out = Vec::new();
    for (i, (k, v)) in metadata.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        out.extend_from_slice(k.as_bytes());
        out.push(UNIT_SEPARATOR);
        out.extend_from_slice(v.as_bytes());
    }
    out
}

fn decode_metadata(buf: &[u8]) -> Result<BTreeMap<String, String>, FrameError> {
    let mut out = BTreeMap::new();
    if buf.is_empty() {
        return Ok(out);
    }
    for pair in buf.split(|&b| b == RECORD_SEPARATOR) {
        let sep = pair
            .iter()
            .position(|&b| b == UNIT_SEPARATOR)
            .ok_or_else(|| FrameError::MalformedMetadata(pair.to_vec()))?;
        let key = String::from_utf8_lossy(&pair[..sep]).into_owned();
        let value = String::from_utf8_lossy(&pair[sep + 1..]).into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

/// Decode a complete in-memory buffer into `(metadata, payload)`.
pub fn decode(buf: &[u8]) -> Result<(BTreeMap<String, String>, Vec<u8>), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::FrameTooSmall(buf.len()));
    }
    if &buf[0..4] != MAGIC {
        return Err(FrameError::InvalidMarker);
    }
    let metadata_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as u64;
    let payload_len = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as u64;

    let max_segment = i32::MAX as u64;
    if metadata_len > max_segment {
        return Err(FrameError::SegmentTooLarge(metadata_len));
    }
    if payload_len > max_segment {
        return Err(FrameError::SegmentTooLarge(payload_len));
    }

    let expected_total = HEADER_LEN as u64 + metadata_len + payload_len;
    if expected_total != buf.len() as u64 {
        return Err(FrameError::LengthMismatch {
            expected: expected_total as usize,
            actual: buf.len(),
        });
    }

    let metadata_start = HEADER_LEN;
    let metadata_end = metadata_start + metadata_len as usize;
    let metadata = decode_metadata(&buf[metadata_start..metadata_end])?;
    let payload = buf[metadata_end..].to_vec();
    Ok((metadata, payload))
}

/// Decode a frame from a blocking `Read`, distinguishing clean EOF (no
/// bytes read at all) from a truncated header.
pub fn decode_from_reader<R: Read>(
    mut reader: R,
) -> Result<(BTreeMap<String, String>, Vec<u8>), FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let mut read_total = 0;
    loop {
        match reader.read(&mut header[read_total..]) {
            Ok(0) => {
                if read_total == 0 {
                    return Err(FrameError::Eof);
                }
                return Err(FrameError::ReadHeaderError(format!(
                    "got {read_total} of {HEADER_LEN} header bytes before EOF"
                )));
            }
            Ok(n) => {
                read_total += n;
                if read_total == HEADER_LEN {
                    break;
                }
            }
            Err(e) => return Err(FrameError::ReadHeaderError(e.to_string())),
        }
    }

    if &header[0..4] != MAGIC {
        return Err(FrameError::InvalidMarker);
    }
    let metadata_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as u64;
    let payload_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as u64;
    let max_segment = i32::MAX as u64;
    if metadata_len > max_segment {
        return Err(FrameError::SegmentTooLarge(metadata_len));
    }
    if payload_len > max_segment {
        return Err(FrameError::SegmentTooLarge(payload_len));
    }

    let mut rest = vec![0u8; (metadata_len + payload_len) as usize];
    reader
        .read_exact(&mut rest)
        .map_err(|e| FrameError::ReadHeaderError(e.to_string()))?;

    let metadata = decode_metadata(&rest[..metadata_len as usize])?;
    let payload = rest[metadata_len as usize..].to_vec();
    Ok((metadata, payload))
}

impl From<FrameError> for crate::error::Error {
    fn from(e: FrameError) -> Self {
        crate::error::Error::DecodeError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip() {
        let metadata = map(&[("k", "v")]);
        let encoded = encode(&metadata, b"data");
        let (decoded_meta, decoded_payload) = decode(&encoded).unwrap();
        assert_eq!(decoded_meta, metadata);
        assert_eq!(decoded_payload, b"data");
    }

    #[test]
    fn known_vector_is_20_bytes() {
        let metadata = map(&[("k", "v")]);
        let encoded = encode(&metadata, b"data");
        assert_eq!(encoded.len(), 20);
        assert_eq!(&encoded[0..4], b"EBF1");
        assert_eq!(&encoded[4..8], &4u32.to_be_bytes());
        assert_eq!(&encoded[8..12], &4u32.to_be_bytes());
        assert_eq!(&encoded[12..16], b"k\x1Fv");
        assert_eq!(&encoded[16..20], b"data");
    }

    #[test]
    fn truncation_yields_length_mismatch() {
        let metadata = map(&[("k", "v")]);
        let encoded = encode(&metadata, b"data");
        let truncated = &encoded[..19];
        assert_eq!(
            decode(truncated).unwrap_err(),
            FrameError::LengthMismatch {
                expected: 20,
                actual: 19
            }
        );
    }

    #[test]
    fn bad_magic_yields_invalid_marker() {
        let metadata = map(&[("k", "v")]);
        let mut encoded = encode(&metadata, b"data");
        encoded[0..4].copy_from_slice(b"BAD!");
        assert_eq!(decode(&encoded).unwrap_err(), FrameError::InvalidMarker);
    }

    #[test]
    fn frame_too_small() {
        assert_eq!(
            decode(&[0u8; 4]).unwrap_err(),
            FrameError::FrameTooSmall(4)
        );
    }

    #[test]
    fn malformed_metadata_missing_unit_separator() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(b"abc"); // no unit separator
        assert!(matches!(
            decode(&buf).unwrap_err(),
            FrameError::MalformedMetadata(_)
        ));
    }

    #[test]
    fn empty_metadata_round_trips() {
        let metadata = BTreeMap::new();
        let encoded = encode(&metadata, b"payload");
        let (decoded_meta, decoded_payload) = decode(&encoded).unwrap();
        assert!(decoded_meta.is_empty());
        assert_eq!(decoded_payload, b"payload");
    }

    #[test]
    fn reader_reports_eof_before_any_header_byte() {
        let empty: &[u8] = &[];
        assert_eq!(
            decode_from_reader(empty).unwrap_err(),
            FrameError::Eof
        );
    }

    #[test]
    fn reader_reports_partial_header_error() {
        let partial: &[u8] = &MAGIC[..];
        match decode_from_reader(partial) {
            Err(FrameError::ReadHeaderError(_)) => {}
            other => panic!("expected ReadHeaderError, got {other:?}"),
        }
    }

    #[test]
    fn reader_round_trips_full_frame() {
        let metadata = map(&[("a", "1"), ("b", "2")]);
        let encoded = encode(&metadata, b"hello world");
        let (decoded_meta, decoded_payload) = decode_from_reader(&encoded[..]).unwrap();
        assert_eq!(decoded_meta, metadata);
        assert_eq!(decoded_payload, b"hello world");
    }

    #[test]
    fn metadata_keys_are_sorted_in_encoding() {
        let metadata = map(&[("zeta", "1"), ("alpha", "2")]);
        let encoded = encode(&metadata, b"");
        let (_, _) = decode(&encoded).unwrap();
        // alpha sorts before zeta; find "alpha" occurs before "zeta" in bytes
        let alpha_pos = encoded.windows(5).position(|w| w == b"alpha").unwrap();
        let zeta_pos = encoded.windows(4).position(|w| w == b"zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }
}
