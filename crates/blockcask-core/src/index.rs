//! Sharded in-memory index from key to on-disk position.
//!
//! Keys are spread across N ordered maps by a stable hash, each shard
//! guarded by its own lock, so point lookups on unrelated keys never
//! contend. The shard count must be a power of two.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::position::Position;

type Shard = BTreeMap<Vec<u8>, Position>;

pub struct ShardedIndex {
    shards: Vec<RwLock<Shard>>,
}

impl ShardedIndex {
    /// Create an index with `num_shards` shards. `num_shards` must be a
    /// power of two.
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two(), "index shard count must be a power of two");
        Self {
            shards: (0..num_shards).map(|_| RwLock::new(BTreeMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &[u8]) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize & (self.shards.len() - 1)]
    }

    pub fn put(&self, key: Vec<u8>, pos: Position) {
        self.shard_for(&key).write().insert(key, pos);
    }

    pub fn get(&self, key: &[u8]) -> Option<Position> {
        self.shard_for(key).read().get(key).cloned()
    }

    pub fn delete(&self, key: &[u8]) {
        self.shard_for(key).write().remove(key);
    }

    /// Total entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(filename: &str, offset: u64) -> Position {
        Position::new(filename.to_string(), offset)
    }

    #[test]
    fn test_put_get_delete() {
        let index = ShardedIndex::new(4);

        index.put(b"k1".to_vec(), pos("00000001.data", 0));
        index.put(b"k2".to_vec(), pos("00000001.data", 40));

        assert_eq!(index.get(b"k1"), Some(pos("00000001.data", 0)));
        assert_eq!(index.get(b"k2"), Some(pos("00000001.data", 40)));
        assert_eq!(index.get(b"k3"), None);
        assert_eq!(index.len(), 2);

        index.delete(b"k1");
        assert_eq!(index.get(b"k1"), None);
        assert_eq!(index.len(), 1);

        // deleting a missing key is fine
        index.delete(b"k1");
    }

    #[test]
    fn test_overwrite() {
        let index = ShardedIndex::new(4);
        index.put(b"k".to_vec(), pos("00000001.data", 0));
        index.put(b"k".to_vec(), pos("00000002.data", 128));
        assert_eq!(index.get(b"k"), Some(pos("00000002.data", 128)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_spread_across_shards() {
        let index = ShardedIndex::new(4);
        for i in 0..1000 {
            let key = format!("key-{:04}", i).into_bytes();
            index.put(key, pos("00000001.data", i));
        }
        assert_eq!(index.len(), 1000);
        for i in 0..1000 {
            let key = format!("key-{:04}", i).into_bytes();
            assert_eq!(index.get(&key), Some(pos("00000001.data", i)));
        }
    }

    #[test]
    #[should_panic]
    fn test_non_power_of_two_rejected() {
        let _ = ShardedIndex::new(3);
    }
}
