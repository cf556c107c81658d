//! Segmented-LRU admission cache for hot block reads.
//!
//! Two byte-bounded FIFO queues behind one mutex. New entries land in
//! `probation`; a hit there promotes the entry to `protection`. When
//! protection overflows, its tail demotes back to the probation front; when
//! probation overflows, its tail is discarded. An entry's cost is
//! `key length + value length + 1` bytes, and a queue only counts as over
//! its limit when the running size is strictly greater than the limit.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;

struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Entry {
    fn cost(&self) -> usize {
        self.key.len() + self.value.len() + 1
    }
}

/// Insertion-ordered queue with by-key lookup and byte-size accounting.
/// Larger sequence numbers are closer to the front.
struct Queue {
    entries: BTreeMap<u64, Entry>,
    by_key: HashMap<Vec<u8>, u64>,
    size: usize,
    limit: usize,
}

impl Queue {
    fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            size: 0,
            limit,
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.by_key.contains_key(key)
    }

    fn insert_front(&mut self, seq: u64, key: Vec<u8>, value: Vec<u8>) {
        if let Some(old_seq) = self.by_key.remove(&key) {
            if let Some(old) = self.entries.remove(&old_seq) {
                self.size -= old.cost();
            }
        }
        let entry = Entry { key: key.clone(), value };
        self.size += entry.cost();
        self.entries.insert(seq, entry);
        self.by_key.insert(key, seq);
    }

    fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        let seq = self.by_key.remove(key)?;
        let entry = self.entries.remove(&seq)?;
        self.size -= entry.cost();
        Some(entry)
    }

    fn pop_tail(&mut self) -> Option<Entry> {
        let (_, entry) = self.entries.pop_first()?;
        self.by_key.remove(&entry.key);
        self.size -= entry.cost();
        Some(entry)
    }

    fn exceeds(&self) -> bool {
        self.size > self.limit
    }
}

struct SlruInner {
    probation: Queue,
    protection: Queue,
    seq: u64,
}

impl SlruInner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move an entry to the protection front and rebalance both queues.
    fn promote(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let seq = self.next_seq();
        self.protection.insert_front(seq, key, value);
        while self.protection.exceeds() {
            if let Some(demoted) = self.protection.pop_tail() {
                let seq = self.next_seq();
                self.probation.insert_front(seq, demoted.key, demoted.value);
            }
        }
        while self.probation.exceeds() {
            self.probation.pop_tail();
        }
    }
}

/// S³-like segmented LRU cache bounded by byte size.
pub struct SlruCache {
    inner: Mutex<SlruInner>,
}

impl SlruCache {
    pub fn new(probation_limit: usize, protection_limit: usize) -> Self {
        Self {
            inner: Mutex::new(SlruInner {
                probation: Queue::new(probation_limit),
                protection: Queue::new(protection_limit),
                seq: 0,
            }),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock();

        if inner.probation.contains(key) {
            inner.probation.remove(key);
            inner.promote(key.to_vec(), value.to_vec());
            return;
        }

        if inner.protection.contains(key) {
            let seq = inner.next_seq();
            inner.protection.insert_front(seq, key.to_vec(), value.to_vec());
            return;
        }

        let seq = inner.next_seq();
        inner.probation.insert_front(seq, key.to_vec(), value.to_vec());
        while inner.probation.exceeds() {
            inner.probation.pop_tail();
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.probation.remove(key) {
            let value = entry.value.clone();
            inner.promote(entry.key, entry.value);
            return Some(value);
        }

        if let Some(entry) = inner.protection.remove(key) {
            let value = entry.value.clone();
            let seq = inner.next_seq();
            inner.protection.insert_front(seq, entry.key, entry.value);
            return Some(value);
        }

        None
    }

    /// Bytes currently held in the probation queue.
    pub fn probation_bytes(&self) -> usize {
        self.inner.lock().probation.size
    }

    /// Bytes currently held in the protection queue.
    pub fn protection_bytes(&self) -> usize {
        self.inner.lock().protection.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // each entry below costs key + value + 1 bytes
    fn entry_cost(key: &[u8], value: &[u8]) -> usize {
        key.len() + value.len() + 1
    }

    #[test]
    fn test_miss() {
        let cache = SlruCache::new(100, 100);
        assert_eq!(cache.get(b"nope"), None);
    }

    #[test]
    fn test_insert_lands_in_probation() {
        let cache = SlruCache::new(100, 100);
        cache.put(b"k", b"value");
        assert_eq!(cache.probation_bytes(), entry_cost(b"k", b"value"));
        assert_eq!(cache.protection_bytes(), 0);
    }

    #[test]
    fn test_hit_promotes_to_protection() {
        let cache = SlruCache::new(100, 100);
        cache.put(b"k", b"value");

        assert_eq!(cache.get(b"k"), Some(b"value".to_vec()));
        assert_eq!(cache.probation_bytes(), 0);
        assert_eq!(cache.protection_bytes(), entry_cost(b"k", b"value"));

        // a protection hit stays in protection
        assert_eq!(cache.get(b"k"), Some(b"value".to_vec()));
        assert_eq!(cache.protection_bytes(), entry_cost(b"k", b"value"));
    }

    #[test]
    fn test_probation_overflow_discards_oldest() {
        // each "kN" -> "vN" entry costs 2 + 2 + 1 = 5 bytes
        let cache = SlruCache::new(10, 100);
        cache.put(b"k1", b"v1");
        cache.put(b"k2", b"v2");
        assert_eq!(cache.probation_bytes(), 10); // at the limit, not over it

        cache.put(b"k3", b"v3"); // pushes size to 15, evicting k1
        assert_eq!(cache.probation_bytes(), 10);
        assert_eq!(cache.get(b"k1"), None);
        assert_eq!(cache.get(b"k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_protection_overflow_demotes_to_probation() {
        let cache = SlruCache::new(100, 10);
        cache.put(b"k1", b"v1");
        cache.put(b"k2", b"v2");
        cache.put(b"k3", b"v3");

        // promote all three; protection holds 5 bytes each, limit 10
        assert!(cache.get(b"k1").is_some());
        assert!(cache.get(b"k2").is_some());
        assert!(cache.get(b"k3").is_some());

        // k1 was demoted back to probation when k3 arrived
        assert_eq!(cache.protection_bytes(), 10);
        assert_eq!(cache.probation_bytes(), 5);
        assert_eq!(cache.get(b"k1"), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_put_overwrites_in_protection() {
        let cache = SlruCache::new(100, 100);
        cache.put(b"k", b"old");
        assert!(cache.get(b"k").is_some()); // promote

        cache.put(b"k", b"new value");
        assert_eq!(cache.get(b"k"), Some(b"new value".to_vec()));
        assert_eq!(cache.protection_bytes(), entry_cost(b"k", b"new value"));
        assert_eq!(cache.probation_bytes(), 0);
    }

    #[test]
    fn test_put_on_probation_resident_promotes() {
        let cache = SlruCache::new(100, 100);
        cache.put(b"k", b"old");
        cache.put(b"k", b"new");
        assert_eq!(cache.probation_bytes(), 0);
        assert_eq!(cache.protection_bytes(), entry_cost(b"k", b"new"));
        assert_eq!(cache.get(b"k"), Some(b"new".to_vec()));
    }
}
