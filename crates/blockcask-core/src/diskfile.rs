//! Append-only segment file with positional reads.
//!
//! An active file is appended to through the OS file API. Once sealed it is
//! re-opened through a read-only memory map and never written again; reads
//! then go through the map.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::{CaskError, CaskResult};
use crate::position::Position;
use crate::record::{decode_header, verify_crc, Record, CRC_SLOT_SIZE, RECORD_HEADER_SIZE};

/// A single append-only segment file.
pub struct DiskFile {
    file: File,
    path: PathBuf,
    filename: String,
    /// Offset of the next append; equals the file length.
    write_offset: AtomicU64,
    /// Read-only view installed when the file is sealed.
    map: RwLock<Option<Mmap>>,
}

impl DiskFile {
    /// Open (creating if needed) `dir/filename` for appending.
    pub fn open(dir: &Path, filename: &str) -> CaskResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| CaskError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to create segment directory: {}", e),
        })?;

        let path = dir.join(filename);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| CaskError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to open segment file: {}", e),
            })?;

        let len = file
            .metadata()
            .map_err(|e| CaskError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to stat segment file: {}", e),
            })?
            .len();

        Ok(Self {
            file,
            path,
            filename: filename.to_string(),
            write_offset: AtomicU64::new(len),
            map: RwLock::new(None),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Offset at which the next append will land.
    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Append raw bytes, returning the pre-write offset.
    ///
    /// Callers serialize appends through the owning segment list's lock.
    pub fn append(&self, buf: &[u8]) -> CaskResult<u64> {
        let offset = self.write_offset.load(Ordering::Acquire);
        (&self.file).write_all(buf).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("segment append failed: {}", e),
        })?;
        self.write_offset.store(offset + buf.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Positional read filling `buf` from `offset`. Sealed files read
    /// through the mmap view, active files through the OS file API.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> CaskResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(map) = self.map.read().as_ref() {
            let start = offset as usize;
            let end = start + buf.len();
            if end > map.len() {
                return Err(CaskError::EndOfFile { offset, size: map.len() as u64 });
            }
            buf.copy_from_slice(&map[start..end]);
            return Ok(());
        }
        self.file.read_exact_at(buf, offset).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("positional read at {} failed: {}", offset, e),
        })
    }

    /// Current file size in bytes.
    pub fn size(&self) -> CaskResult<u64> {
        if let Some(map) = self.map.read().as_ref() {
            return Ok(map.len() as u64);
        }
        let meta = self.file.metadata().map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to stat segment file: {}", e),
        })?;
        Ok(meta.len())
    }

    /// Switch reads over to a read-only memory map. Called when the file
    /// moves from active to sealed; the file is never appended to after this.
    pub fn seal(&self) -> CaskResult<()> {
        let size = self.size()?;
        if size == 0 {
            // mapping a zero-length file is an error on Linux
            return Ok(());
        }
        let map = unsafe { Mmap::map(&self.file) }.map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to mmap sealed segment: {}", e),
        })?;
        *self.map.write() = Some(map);
        Ok(())
    }

    /// Read and verify one record starting at `offset`.
    ///
    /// Returns the record and the total number of bytes it occupies.
    /// `EndOfFile` when `offset` is at or past the file end.
    pub fn read_record(&self, offset: u64) -> CaskResult<(Record, u64)> {
        let size = self.size()?;
        if offset >= size {
            return Err(CaskError::EndOfFile { offset, size });
        }

        let header_len = (RECORD_HEADER_SIZE as u64).min(size - offset) as usize;
        let mut header_buf = vec![0u8; header_len];
        self.read_at(&mut header_buf, offset)?;

        let (header, n) = decode_header(&header_buf, offset)?;
        let body_len = header.key_size + header.value_size;

        if offset + (n + body_len) as u64 > size {
            // truncated tail
            return Err(CaskError::CrcMismatch { expected: header.crc, actual: 0, offset });
        }

        let mut body = vec![0u8; body_len];
        self.read_at(&mut body, offset + n as u64)?;
        verify_crc(&header, &header_buf[CRC_SLOT_SIZE..n], &body, offset)?;

        let value = body.split_off(header.key_size);
        Ok((
            Record { key: body, value, kind: header.kind },
            (n + body_len) as u64,
        ))
    }

    /// Read the whole file into memory once and decode every record.
    pub fn read_all_records(&self) -> CaskResult<Vec<Record>> {
        let buf = self.read_to_end()?;
        crate::record::decode_stream(&buf)
    }

    /// Read the whole file once and return each record paired with its
    /// position. Values are not materialized; only keys and kinds are needed
    /// for index rebuild.
    pub fn read_all_positions(&self) -> CaskResult<Vec<(Record, Position)>> {
        let buf = self.read_to_end()?;
        let mut out = Vec::new();
        let mut offset = 0usize;

        while offset < buf.len() {
            let (header, n) = decode_header(&buf[offset..], offset as u64)?;

            let key_from = offset + n;
            let value_to = key_from + header.key_size + header.value_size;
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

            out.push((
                Record {
                    key: buf[key_from..key_from + header.key_size].to_vec(),
                    value: Vec::new(),
                    kind: header.kind,
                },
                Position::new(self.filename.clone(), offset as u64),
            ));

            offset = value_to;
        }

        Ok(out)
    }

    fn read_to_end(&self) -> CaskResult<Vec<u8>> {
        let size = self.size()?;
        let mut buf = vec![0u8; size as usize];
        self.read_at(&mut buf, 0)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use tempfile::TempDir;

    fn write_records(df: &DiskFile, records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| df.append(&r.encode()).unwrap()).collect()
    }

    #[test]
    fn test_append_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();

        let record = Record::new(b"alpha".to_vec(), b"beta".to_vec(), RecordKind::Normal);
        let offset = df.append(&record.encode()).unwrap();
        assert_eq!(offset, 0);

        let (read, n) = df.read_record(offset).unwrap();
        assert_eq!(read, record);
        assert_eq!(n, record.encode().len() as u64);
        assert_eq!(df.write_offset(), n);
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();
        df.append(&Record::new(b"k".to_vec(), b"v".to_vec(), RecordKind::Normal).encode())
            .unwrap();

        let end = df.write_offset();
        assert!(matches!(df.read_record(end), Err(CaskError::EndOfFile { .. })));
        assert!(matches!(df.read_record(end + 100), Err(CaskError::EndOfFile { .. })));
    }

    #[test]
    fn test_read_all_positions() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();

        let records = vec![
            Record::new(b"a".to_vec(), b"one".to_vec(), RecordKind::Normal),
            Record::tombstone(b"b".to_vec()),
            Record::new(b"c".to_vec(), vec![7u8; 500], RecordKind::Normal),
        ];
        let offsets = write_records(&df, &records);

        let entries = df.read_all_positions().unwrap();
        assert_eq!(entries.len(), 3);
        for (i, (record, pos)) in entries.iter().enumerate() {
            assert_eq!(record.key, records[i].key);
            assert_eq!(record.kind, records[i].kind);
            assert!(record.value.is_empty());
            assert_eq!(pos.offset, offsets[i]);
            assert_eq!(pos.filename, "00000001.data");

            // the position resolves back to the full record
            let (full, _) = df.read_record(pos.offset).unwrap();
            assert_eq!(full, records[i]);
        }
    }

    #[test]
    fn test_sealed_reads_through_mmap() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();

        let records = vec![
            Record::new(b"x".to_vec(), b"1".to_vec(), RecordKind::Normal),
            Record::new(b"y".to_vec(), b"2".to_vec(), RecordKind::Normal),
        ];
        let offsets = write_records(&df, &records);

        df.seal().unwrap();

        let (read, _) = df.read_record(offsets[1]).unwrap();
        assert_eq!(read, records[1]);
        assert_eq!(df.read_all_records().unwrap(), records);
    }

    #[test]
    fn test_file_is_concatenation_of_encoded_records() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();

        let records = vec![
            Record::new(b"first".to_vec(), b"1".to_vec(), RecordKind::Normal),
            Record::new(b"second".to_vec(), vec![0x42; 90], RecordKind::BlockData),
            Record::tombstone(b"third".to_vec()),
        ];
        write_records(&df, &records);

        // re-encoding the decoded records reproduces the file byte for byte
        let raw = std::fs::read(tmp.path().join("00000001.data")).unwrap();
        let reencoded: Vec<u8> = df
            .read_all_records()
            .unwrap()
            .iter()
            .flat_map(|r| r.encode())
            .collect();
        assert_eq!(reencoded, raw);
    }

    #[test]
    fn test_seal_empty_file_is_noop() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();
        df.seal().unwrap();
        assert!(df.read_all_records().unwrap().is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let tmp = TempDir::new().unwrap();
        let df = DiskFile::open(tmp.path(), "00000001.data").unwrap();
        let record = Record::new(b"key".to_vec(), b"value".to_vec(), RecordKind::Normal);
        let offset = df.append(&record.encode()).unwrap();

        // flip a byte in the value region
        let path = tmp.path().join("00000001.data");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let reopened = DiskFile::open(tmp.path(), "00000001.data").unwrap();
        assert!(matches!(reopened.read_record(offset), Err(CaskError::CrcMismatch { .. })));
        assert!(matches!(reopened.read_all_records(), Err(CaskError::CrcMismatch { .. })));
        assert!(matches!(reopened.read_all_positions(), Err(CaskError::CrcMismatch { .. })));
    }
}
