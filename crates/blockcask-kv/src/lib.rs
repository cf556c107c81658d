//! Generic key/value adapter over the blockcask engine.
//!
//! The embedding node sees a flat byte-keyed store with a handful of
//! blockchain-shaped extensions:
//!
//! - `get`/`set`/`delete` operate on full block records
//! - `set_block_part`/`get_block_part`/`get_block_parts` address block
//!   shards by `(height, index)` under the `P:<height>:<index>` convention
//! - `set_prov_data`/`get_prov_data` reach the per-entity provenance logs
//!
//! The `*_sync` variants exist for interface compatibility; the engine's
//! durability is WAL-bounded and no extra sync semantics are provided.

use std::path::Path;

use blockcask_core::{part_key, Engine, RecordKind};

pub use blockcask_core::{CaskError, CaskResult, Options};

/// Block store facade over a [`blockcask_core::Engine`].
pub struct BlockStore {
    engine: Engine,
}

impl BlockStore {
    /// Open a store rooted at `data_dir` with merge staging in `merge_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P, merge_dir: P, enable_prov: bool) -> CaskResult<Self> {
        let mut opts = Options::default();
        opts.data_dir = data_dir.as_ref().to_path_buf();
        opts.merge_dir = merge_dir.as_ref().to_path_buf();
        opts.wal_file_path = opts.data_dir.join("wal.log");
        opts.enable_prov = enable_prov;
        Self::open_with_options(opts)
    }

    /// Open with full control over the engine configuration.
    pub fn open_with_options(opts: Options) -> CaskResult<Self> {
        Ok(Self { engine: Engine::open(opts)? })
    }

    /// The underlying engine, for operations the facade does not cover
    /// (e.g. compaction).
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Read a block record. Empty keys are an error; a missing key is
    /// `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> CaskResult<Option<Vec<u8>>> {
        ensure_key(key)?;
        self.engine.get(key, RecordKind::BlockData)
    }

    pub fn has(&self, key: &[u8]) -> CaskResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Store a block record.
    pub fn set(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        ensure_key(key)?;
        self.engine.put(key, value, RecordKind::BlockData)
    }

    /// Identical to [`BlockStore::set`].
    pub fn set_sync(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        self.set(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> CaskResult<()> {
        ensure_key(key)?;
        self.engine.delete(key)
    }

    /// Identical to [`BlockStore::delete`].
    pub fn delete_sync(&self, key: &[u8]) -> CaskResult<()> {
        self.delete(key)
    }

    /// Store one block part under a prebuilt `P:<height>:<index>` key.
    pub fn set_block_part(&self, key: &[u8], value: &[u8]) -> CaskResult<()> {
        ensure_key(key)?;
        self.engine.put(key, value, RecordKind::BlockPart)
    }

    /// Read one block part by `(height, index)`.
    pub fn get_block_part(&self, height: u64, index: usize) -> CaskResult<Option<Vec<u8>>> {
        self.engine.get_block_part(height, index)
    }

    /// Read all parts of a block. Missing parts leave their slot `None`.
    pub fn get_block_parts(&self, height: u64, total: usize) -> CaskResult<Vec<Option<Vec<u8>>>> {
        self.engine.get_block_parts(height, total)
    }

    /// Append an opaque provenance value to the entity's log.
    pub fn set_prov_data(&self, entity_id: &[u8], value: &[u8]) -> CaskResult<()> {
        self.engine.put(entity_id, value, RecordKind::Provenance)
    }

    /// All provenance values logged for the entity, in insertion order.
    pub fn get_prov_data(&self, entity_id: &str) -> CaskResult<Vec<Vec<u8>>> {
        self.engine.get_prov_data(entity_id)
    }

    /// Drop the entity's provenance log.
    pub fn delete_prov_data(&self, entity_id: &str) -> CaskResult<()> {
        self.engine.delete_prov_data(entity_id)
    }

    pub fn close(&self) -> CaskResult<()> {
        self.engine.close()
    }
}

/// Build the block-part key for `(height, index)`.
pub fn block_part_key(height: u64, index: usize) -> Vec<u8> {
    part_key(height, index)
}

fn ensure_key(key: &[u8]) -> CaskResult<()> {
    if key.is_empty() {
        return Err(CaskError::EmptyKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(tmp: &TempDir) -> BlockStore {
        BlockStore::open(tmp.path().join("data"), tmp.path().join("merge"), false).unwrap()
    }

    #[test]
    fn test_set_get_has() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store.set(b"meta", b"bytes").unwrap();
        assert_eq!(store.get(b"meta").unwrap(), Some(b"bytes".to_vec()));
        assert!(store.has(b"meta").unwrap());
        assert!(!store.has(b"absent").unwrap());
        store.close().unwrap();
    }

    #[test]
    fn test_empty_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        assert!(matches!(store.get(b""), Err(CaskError::EmptyKey)));
        assert!(matches!(store.set(b"", b"v"), Err(CaskError::EmptyKey)));
        assert!(matches!(store.delete(b""), Err(CaskError::EmptyKey)));
        store.close().unwrap();
    }

    #[test]
    fn test_sync_variants_behave_like_plain() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store.set_sync(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete_sync(b"k").unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_block_part_key_convention() {
        assert_eq!(block_part_key(100, 7), b"P:100:7".to_vec());
    }
}
