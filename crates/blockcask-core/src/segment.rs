//! A family of segment files of one record class: one active file being
//! appended to, plus a map of sealed older files.
//!
//! Rotation happens when the active file's write offset has reached the
//! configured threshold, checked before a write so a record is never split
//! across files. Sealing mmaps the file read-only in the same critical
//! section that moves it into the older map.

use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::cache::SlruCache;
use crate::diskfile::DiskFile;
use crate::error::{CaskError, CaskResult};
use crate::position::Position;
use crate::record::Record;

struct Inner {
    active: Option<Arc<DiskFile>>,
    older: HashMap<u64, Arc<DiskFile>>,
    /// Number of the current active file; monotonic across rotations.
    file_number: u64,
}

pub struct SegmentList {
    dir: PathBuf,
    suffix: &'static str,
    /// Rotation threshold in bytes.
    limit: u64,
    /// Read-through admission cache; only the block-record list carries one.
    cache: Option<SlruCache>,
    inner: RwLock<Inner>,
}

impl SegmentList {
    pub fn new(dir: PathBuf, suffix: &'static str, limit: u64, cache: Option<SlruCache>) -> Self {
        Self {
            dir,
            suffix,
            limit,
            cache,
            inner: RwLock::new(Inner {
                active: None,
                older: HashMap::new(),
                file_number: 0,
            }),
        }
    }

    /// Append a record to the active file, rotating first if the active
    /// file has reached the size threshold. Returns the record's position.
    pub fn write(&self, record: &Record) -> CaskResult<Position> {
        let enc = record.encode();
        if enc.len() as u64 > self.limit {
            return Err(CaskError::SegmentTooLarge {
                record_size: enc.len() as u64,
                limit: self.limit,
            });
        }

        let mut inner = self.inner.write();

        if inner.active.is_none() {
            create_active(&mut inner, &self.dir, self.suffix)?;
        }

        let full = inner
            .active
            .as_ref()
            .is_some_and(|active| active.write_offset() >= self.limit);
        if full {
            seal_active(&mut inner)?;
            create_active(&mut inner, &self.dir, self.suffix)?;
        }

        let active = inner.active.as_ref().expect("active segment after rotation");
        let offset = active.append(&enc)?;
        Ok(Position::new(active.filename().to_string(), offset))
    }

    /// Resolve a position's filename to an open file handle.
    pub fn file_for(&self, filename: &str) -> CaskResult<Arc<DiskFile>> {
        let inner = self.inner.read();

        if let Some(active) = inner.active.as_ref() {
            if active.filename() == filename {
                return Ok(Arc::clone(active));
            }
        }

        let number = parse_segment_number(filename)?;
        inner
            .older
            .get(&number)
            .cloned()
            .ok_or_else(|| CaskError::SegmentNotFound { filename: filename.to_string() })
    }

    pub fn get_cached(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.cache.as_ref()?.get(key)
    }

    pub fn put_cached(&self, key: &[u8], value: &[u8]) {
        if let Some(cache) = self.cache.as_ref() {
            cache.put(key, value);
        }
    }

    /// Install a recovered file as the active segment.
    pub fn install_active(&self, file: Arc<DiskFile>, number: u64) {
        let mut inner = self.inner.write();
        inner.active = Some(file);
        inner.file_number = number;
    }

    /// Install a recovered file as a sealed segment, mmap-backed.
    pub fn install_sealed(&self, file: Arc<DiskFile>, number: u64) -> CaskResult<()> {
        file.seal()?;
        let mut inner = self.inner.write();
        inner.older.insert(number, file);
        Ok(())
    }

    /// Seal the current active file and start a fresh one, so that writes
    /// from now on land in a file whose number is the returned cutoff.
    pub fn rotate_for_merge(&self) -> CaskResult<u64> {
        let mut inner = self.inner.write();
        if inner.active.is_some() {
            seal_active(&mut inner)?;
            create_active(&mut inner, &self.dir, self.suffix)?;
        }
        Ok(inner.file_number)
    }

    /// Numbers of all sealed segments, ascending.
    pub fn sealed_ids(&self) -> Vec<u64> {
        let inner = self.inner.read();
        let mut ids: Vec<u64> = inner.older.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sealed_file(&self, number: u64) -> Option<Arc<DiskFile>> {
        self.inner.read().older.get(&number).cloned()
    }

    /// Drop every file handle. Files close as the handles fall away.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.active = None;
        inner.older.clear();
    }
}

fn create_active(inner: &mut Inner, dir: &PathBuf, suffix: &'static str) -> CaskResult<()> {
    inner.file_number += 1;
    let filename = segment_filename(inner.file_number, suffix);
    let file = Arc::new(DiskFile::open(dir, &filename)?);
    inner.active = Some(file);
    Ok(())
}

fn seal_active(inner: &mut Inner) -> CaskResult<()> {
    if let Some(active) = inner.active.take() {
        active.seal()?;
        info!(file = active.filename(), "sealed segment");
        inner.older.insert(inner.file_number, active);
    }
    Ok(())
}

/// `NNNNNNNN<suffix>` for a segment number, e.g. `00000003.data`.
pub fn segment_filename(number: u64, suffix: &str) -> String {
    format!("{:08}{}", number, suffix)
}

/// Parse the number out of a `NNNNNNNN.<suffix>` segment filename.
pub fn parse_segment_number(filename: &str) -> CaskResult<u64> {
    let mut parts = filename.split('.');
    let (Some(stem), Some(_), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CaskError::InvalidSegmentName { name: filename.to_string() });
    };
    stem.parse::<u64>()
        .map_err(|_| CaskError::InvalidSegmentName { name: filename.to_string() })
}
