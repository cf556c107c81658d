//! Ordered in-memory table for freshly written records.
//!
//! One live instance absorbs writes; on rotation it becomes the immutable
//! instance and is flushed to segment files in ascending key order. The
//! table stores `Delete` tombstones like any other record, so a deleted key
//! reads back as an empty value until the flush removes it from the index.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::CaskResult;
use crate::record::Record;

struct Inner {
    tree: BTreeMap<Vec<u8>, Record>,
    /// Running byte accounting: key length + value length + 1 per entry.
    size: usize,
}

/// Ordered key → record table behind its own reader/writer lock.
pub struct MemTable {
    inner: RwLock<Inner>,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { tree: BTreeMap::new(), size: 0 }),
        }
    }

    /// Insert a record, overwriting any previous record for the key.
    pub fn put(&self, record: Record) {
        let mut inner = self.inner.write();
        let added = record.key.len() + record.value.len() + 1;
        if let Some(old) = inner.tree.insert(record.key.clone(), record) {
            inner.size -= old.key.len() + old.value.len() + 1;
        }
        inner.size += added;
    }

    /// Look up a key. A tombstone reads back as an empty value.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner.tree.get(key).map(|r| r.value.clone())
    }

    /// Records in `[lo, hi)`, in key order.
    pub fn range(&self, lo: &[u8], hi: &[u8]) -> Vec<Record> {
        let inner = self.inner.read();
        inner
            .tree
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tree.is_empty()
    }

    /// Total byte accounting across entries.
    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    /// Walk every record in ascending key order.
    pub fn scan<F>(&self, mut f: F) -> CaskResult<()>
    where
        F: FnMut(&Record) -> CaskResult<()>,
    {
        let inner = self.inner.read();
        for record in inner.tree.values() {
            f(record)?;
        }
        Ok(())
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;

    fn rec(key: &[u8], value: &[u8]) -> Record {
        Record::new(key.to_vec(), value.to_vec(), RecordKind::Normal)
    }

    #[test]
    fn test_put_get() {
        let mt = MemTable::new();
        mt.put(rec(b"k", b"v"));
        assert_eq!(mt.get(b"k"), Some(b"v".to_vec()));
        assert_eq!(mt.get(b"missing"), None);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_overwrite_updates_size() {
        let mt = MemTable::new();
        mt.put(rec(b"k", b"short"));
        assert_eq!(mt.size(), 1 + 5 + 1);

        mt.put(rec(b"k", b"a longer value"));
        assert_eq!(mt.size(), 1 + 14 + 1);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_tombstone_reads_as_empty() {
        let mt = MemTable::new();
        mt.put(rec(b"k", b"v"));
        mt.put(Record::tombstone(b"k".to_vec()));
        assert_eq!(mt.get(b"k"), Some(Vec::new()));
    }

    #[test]
    fn test_scan_in_key_order() {
        let mt = MemTable::new();
        for key in [b"c".as_slice(), b"a", b"b"] {
            mt.put(rec(key, b"x"));
        }

        let mut keys = Vec::new();
        mt.scan(|r| {
            keys.push(r.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_range() {
        let mt = MemTable::new();
        for key in [b"a".as_slice(), b"b", b"c", b"d"] {
            mt.put(rec(key, key));
        }

        let records = mt.range(b"b", b"d");
        let keys: Vec<_> = records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
