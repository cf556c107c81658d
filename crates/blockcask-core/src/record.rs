//! Record codec shared by segment files, the WAL, the merge hint file and
//! provenance files.
//!
//! Wire layout, little-endian fixed fields:
//!
//! ```text
//! [0..5]   crc slot:  4 bytes CRC-32 (IEEE) over everything after the slot,
//!                     5th byte zero padding
//! [5.. ]   key size:  signed varint, at most 5 bytes
//!          value size: signed varint, at most 5 bytes
//!          kind:      1 byte
//!          key        key-size bytes
//!          value      value-size bytes
//! ```
//!
//! A 16-byte header scratch is preallocated (5 crc + 5 + 5 + 1), but the
//! variable-length header on the wire is usually shorter.

use crate::error::{CaskError, CaskResult};

/// Preallocated record header size: 5-byte CRC slot + two 5-byte varint
/// slots + 1 kind byte. The encoded header may be shorter.
pub const RECORD_HEADER_SIZE: usize = 5 + 5 + 5 + 1;

/// Width of the CRC slot on the wire. The CRC occupies the first 4 bytes.
pub(crate) const CRC_SLOT_SIZE: usize = 5;

/// Classifies what a record stores and which file family it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Generic (non-block) data
    Normal = 0,
    /// Tombstone; the value is empty
    Delete = 1,
    /// A shard of a block, keyed `P:<height>:<index>`
    BlockPart = 2,
    /// A full block record
    BlockData = 3,
    /// Per-entity provenance log entry
    Provenance = 4,
}

impl RecordKind {
    fn from_byte(b: u8, offset: u64) -> CaskResult<Self> {
        match b {
            0 => Ok(RecordKind::Normal),
            1 => Ok(RecordKind::Delete),
            2 => Ok(RecordKind::BlockPart),
            3 => Ok(RecordKind::BlockData),
            4 => Ok(RecordKind::Provenance),
            other => Err(CaskError::CorruptedRecord {
                offset,
                reason: format!("unknown record kind byte {}", other),
            }),
        }
    }
}

/// A key/value record together with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub kind: RecordKind,
}

/// Decoded header preview of a record, without key and value bytes.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub crc: u32,
    pub key_size: usize,
    pub value_size: usize,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>, kind: RecordKind) -> Self {
        Self { key, value, kind }
    }

    /// A `Delete` tombstone for `key`. Its value is empty.
    pub fn tombstone(key: Vec<u8>) -> Self {
        Self { key, value: Vec::new(), kind: RecordKind::Delete }
    }

    /// Encode the record into the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = [0u8; RECORD_HEADER_SIZE - CRC_SLOT_SIZE];
        let mut n = put_varint(&mut header, self.key.len() as i64);
        n += put_varint(&mut header[n..], self.value.len() as i64);
        header[n] = self.kind as u8;
        n += 1;

        let mut buf = Vec::with_capacity(CRC_SLOT_SIZE + n + self.key.len() + self.value.len());
        buf.extend_from_slice(&[0u8; CRC_SLOT_SIZE]);
        buf.extend_from_slice(&header[..n]);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf[CRC_SLOT_SIZE..]);
        buf[..4].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Size of the encoded record without encoding it.
    pub fn encoded_len(&self) -> usize {
        CRC_SLOT_SIZE
            + varint_len(self.key.len() as i64)
            + varint_len(self.value.len() as i64)
            + 1
            + self.key.len()
            + self.value.len()
    }
}

/// Parse a record header from the front of `buf`.
///
/// Returns the header and the number of bytes consumed up to (but not
/// including) the key. `buf` may be shorter than [`RECORD_HEADER_SIZE`];
/// a buffer too short to hold even the header surfaces as a CRC mismatch,
/// the same as any other truncated tail.
pub fn decode_header(buf: &[u8], offset: u64) -> CaskResult<(RecordHeader, usize)> {
    if buf.len() < CRC_SLOT_SIZE + 3 {
        return Err(CaskError::CrcMismatch { expected: 0, actual: 0, offset });
    }

    let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut n = CRC_SLOT_SIZE;

    let (key_size, m) = read_varint(&buf[n..])
        .ok_or(CaskError::CrcMismatch { expected: crc, actual: 0, offset })?;
    n += m;
    let (value_size, m) = read_varint(&buf[n..])
        .ok_or(CaskError::CrcMismatch { expected: crc, actual: 0, offset })?;
    n += m;

    if key_size < 0 || value_size < 0 {
        return Err(CaskError::CorruptedRecord {
            offset,
            reason: format!("negative sizes in header: key {}, value {}", key_size, value_size),
        });
    }

    if n >= buf.len() {
        return Err(CaskError::CrcMismatch { expected: crc, actual: 0, offset });
    }
    let kind = RecordKind::from_byte(buf[n], offset)?;
    n += 1;

    Ok((
        RecordHeader {
            crc,
            key_size: key_size as usize,
            value_size: value_size as usize,
            kind,
        },
        n,
    ))
}

/// Decode a concatenation of encoded records, verifying every CRC.
pub fn decode_stream(buf: &[u8]) -> CaskResult<Vec<Record>> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let (header, n) = decode_header(&buf[offset..], offset as u64)?;

        let key_from = offset + n;
        let value_from = key_from + header.key_size;
        let value_to = value_from + header.value_size;

        if value_to > buf.len() {
            return Err(CaskError::CrcMismatch {
                expected: header.crc,
                actual: 0,
                offset: offset as u64,
            });
        }

        let actual = crc32fast::hash(&buf[offset + CRC_SLOT_SIZE..value_to]);
        if actual != header.crc {
            return Err(CaskError::CrcMismatch {
                expected: header.crc,
                actual,
                offset: offset as u64,
            });
        }

        records.push(Record {
            key: buf[key_from..value_from].to_vec(),
            value: buf[value_from..value_to].to_vec(),
            kind: header.kind,
        });

        offset = value_to;
    }

    Ok(records)
}

/// Verify a record's CRC given its header, the encoded header bytes past the
/// CRC slot, and the key+value bytes.
pub(crate) fn verify_crc(
    header: &RecordHeader,
    header_tail: &[u8],
    body: &[u8],
    offset: u64,
) -> CaskResult<()> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_tail);
    hasher.update(body);
    let actual = hasher.finalize();
    if actual != header.crc {
        return Err(CaskError::CrcMismatch { expected: header.crc, actual, offset });
    }
    Ok(())
}

/// Write `v` as a signed (zigzag) varint, returning the number of bytes used.
pub(crate) fn put_varint(buf: &mut [u8], v: i64) -> usize {
    let mut ux = ((v << 1) ^ (v >> 63)) as u64;
    let mut n = 0;
    while ux >= 0x80 {
        buf[n] = (ux as u8) | 0x80;
        ux >>= 7;
        n += 1;
    }
    buf[n] = ux as u8;
    n + 1
}

/// Read a signed (zigzag) varint from the front of `buf`.
/// Returns the value and the number of bytes consumed, or `None` when the
/// buffer ends mid-varint.
pub(crate) fn read_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (n, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        ux |= ((b & 0x7f) as u64) << shift;
        if b < 0x80 {
            let v = (ux >> 1) as i64 ^ -((ux & 1) as i64);
            return Some((v, n + 1));
        }
        shift += 7;
    }
    None
}

fn varint_len(v: i64) -> usize {
    let mut ux = ((v << 1) ^ (v >> 63)) as u64;
    let mut n = 1;
    while ux >= 0x80 {
        ux >>= 7;
        n += 1;
    }
    n
}
