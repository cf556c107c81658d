//! Location of a record inside a segment file.

use crate::error::{CaskError, CaskResult};
use crate::record::{put_varint, read_varint};

/// Identifies the first byte of an encoded record within a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Name of the segment file, e.g. `00000003.data`
    pub filename: String,
    /// Byte offset of the record start within the file
    pub offset: u64,
}

impl Position {
    pub fn new(filename: String, offset: u64) -> Self {
        Self { filename, offset }
    }

    /// Encode as `varint(offset) || filename`. The filename length is
    /// inferred from the surrounding framing when the position is embedded
    /// in a hint record.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = [0u8; 10];
        let n = put_varint(&mut header, self.offset as i64);
        let mut buf = Vec::with_capacity(n + self.filename.len());
        buf.extend_from_slice(&header[..n]);
        buf.extend_from_slice(self.filename.as_bytes());
        buf
    }

    /// Decode a position previously produced by [`Position::encode`].
    pub fn decode(buf: &[u8]) -> CaskResult<Self> {
        let (offset, n) = read_varint(buf).ok_or(CaskError::CorruptedRecord {
            offset: 0,
            reason: "truncated position varint".to_string(),
        })?;
        if offset < 0 {
            return Err(CaskError::CorruptedRecord {
                offset: 0,
                reason: format!("negative position offset {}", offset),
            });
        }
        Ok(Self {
            filename: String::from_utf8_lossy(&buf[n..]).into_owned(),
            offset: offset as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_identity() {
        for (filename, offset) in [
            ("00000001.data", 0u64),
            ("00000042.block", 127),
            ("00000100.part", 64 * 1024 * 1024),
            ("99999999.data", u32::MAX as u64),
        ] {
            let pos = Position::new(filename.to_string(), offset);
            let decoded = Position::decode(&pos.encode()).unwrap();
            assert_eq!(decoded, pos);
        }
    }

    #[test]
    fn test_empty_buffer_rejected() {
        assert!(Position::decode(&[]).is_err());
    }
}
