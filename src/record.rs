//! Wire format for a single WAL record: a length-prefixed, CRC32C-protected
//! `{key, value}` pair.

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub key: String,
    pub value: Vec<u8>,
}

/// Encodes a record as `[len: u32 BE][payload][crc32c: u32 BE]`.
pub fn frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let crc = crc32c::crc32c(&payload);
    let mut out = Vec::with_capacity(4 + payload.len() + 4);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Result of attempting to read one frame from a byte cursor.
pub enum ReadOutcome {
    /// A full, checksum-valid record plus the number of bytes consumed.
    Record(WalRecord, usize),
    /// Not enough bytes remain to contain a complete frame; stop reading, not an error.
    Truncated,
    /// Enough bytes were present but the checksum didn't match.
    Corrupt { consumed: usize, reason: String },
}

/// Attempts to parse one frame starting at `buf[0..]`. Never panics on short input.
pub fn read_one(buf: &[u8]) -> ReadOutcome {
    if buf.len() < 4 {
        return ReadOutcome::Truncated;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + len + 4;
    if buf.len() < total {
        return ReadOutcome::Truncated;
    }
    let payload = &buf[4..4 + len];
    let expected_crc = u32::from_be_bytes([
        buf[4 + len],
        buf[4 + len + 1],
        buf[4 + len + 2],
        buf[4 + len + 3],
    ]);
    let actual_crc = crc32c::crc32c(payload);
    if actual_crc != expected_crc {
        return ReadOutcome::Corrupt {
            consumed: total,
            reason: format!("crc mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
        };
    }
    match bincode::serde::decode_from_slice::<WalRecord, _>(payload, bincode::config::standard()) {
        Ok((record, _)) => ReadOutcome::Record(record, total),
        Err(e) => ReadOutcome::Corrupt {
            consumed: total,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let record = WalRecord {
            key: "k1".to_string(),
            value: b"hello".to_vec(),
        };
        let bytes = frame(&record).unwrap();
        match read_one(&bytes) {
            ReadOutcome::Record(got, consumed) => {
                assert_eq!(got, record);
                assert_eq!(consumed, bytes.len());
            }
            _ => panic!("expected a full record"),
        }
    }

    #[test]
    fn truncated_tail_is_detected() {
        let record = WalRecord {
            key: "k1".to_string(),
            value: b"hello".to_vec(),
        };
        let mut bytes = frame(&record).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(read_one(&bytes), ReadOutcome::Truncated));
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let record = WalRecord {
            key: "k1".to_string(),
            value: b"hello".to_vec(),
        };
        let mut bytes = frame(&record).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(read_one(&bytes), ReadOutcome::Corrupt { .. }));
    }
}
