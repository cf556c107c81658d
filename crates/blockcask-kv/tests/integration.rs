//! End-to-end scenarios driven through the adapter: persistence across
//! close/open cycles, block-part retrieval after flush, compaction and the
//! provenance side-channel.

use blockcask_core::RecordKind;
use blockcask_kv::{block_part_key, BlockStore, Options};
use tempfile::TempDir;

fn open_store(tmp: &TempDir) -> BlockStore {
    BlockStore::open(tmp.path().join("data"), tmp.path().join("merge"), false).unwrap()
}

fn options(tmp: &TempDir) -> Options {
    let mut opts = Options::default();
    opts.data_dir = tmp.path().join("data");
    opts.merge_dir = tmp.path().join("merge");
    opts.wal_file_path = opts.data_dir.join("wal.log");
    opts
}

#[test]
fn single_key_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_store(&tmp);
        store.set(b"k", b"v").unwrap();
        store.close().unwrap();
    }

    let store = open_store(&tmp);
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    store.close().unwrap();
}

#[test]
fn thousand_keys_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_store(&tmp);
        for i in 0..1000 {
            let key = format!("{}", i).into_bytes();
            store.set(&key, &key).unwrap();
        }
        store.close().unwrap();
    }

    let store = open_store(&tmp);
    for i in 0..1000 {
        let key = format!("{}", i).into_bytes();
        assert_eq!(store.get(&key).unwrap(), Some(key.clone()), "key {}", i);
    }
    store.close().unwrap();
}

#[test]
fn overwrite_with_empty_value() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    store.set(b"name", b"alice").unwrap();
    store.set(b"name", b"").unwrap();
    assert_eq!(store.get(b"name").unwrap(), Some(Vec::new()));

    store.close().unwrap();
}

#[test]
fn block_parts_roundtrip_through_flush() {
    let tmp = TempDir::new().unwrap();
    let total = 50usize;

    let part = |index: usize| -> Vec<u8> { vec![index as u8; 64 * 1024] };

    {
        let mut opts = options(&tmp);
        // small threshold so parts spill to disk while they are written
        opts.mem_table_size = 256 * 1024;
        let store = BlockStore::open_with_options(opts).unwrap();

        for index in 0..total {
            store.set_block_part(&block_part_key(100, index), &part(index)).unwrap();
        }

        // mixed read: some parts still in memory, some already on disk
        let parts = store.get_block_parts(100, total).unwrap();
        for (index, got) in parts.iter().enumerate() {
            assert_eq!(got.as_deref(), Some(part(index).as_slice()), "part {}", index);
        }
        store.close().unwrap();
    }

    // pure disk read through the position-sorted coalesced path
    let store = open_store(&tmp);
    let parts = store.get_block_parts(100, total).unwrap();
    for (index, got) in parts.iter().enumerate() {
        assert_eq!(got.as_deref(), Some(part(index).as_slice()), "part {}", index);
    }
    assert_eq!(store.get_block_part(100, 7).unwrap(), Some(part(7)));

    // absent indices stay unfilled without failing the call
    let sparse = store.get_block_parts(100, total + 10).unwrap();
    assert_eq!(sparse.len(), total + 10);
    assert!(sparse[total..].iter().all(|slot| slot.is_none()));

    store.close().unwrap();
}

#[test]
fn merge_drops_deleted_keys_and_leaves_hint() {
    let tmp = TempDir::new().unwrap();
    let count = 5000usize;

    {
        let mut opts = options(&tmp);
        opts.disk_file_size = 64 * 1024;
        let store = BlockStore::open_with_options(opts).unwrap();

        for i in 0..count {
            let key = format!("{}", i).into_bytes();
            store.engine().put(&key, &key, RecordKind::Normal).unwrap();
        }
        for i in (0..count).step_by(16) {
            let key = format!("{}", i).into_bytes();
            store.delete(&key).unwrap();
        }

        store.engine().merge().unwrap();
        store.close().unwrap();
    }

    let store = open_store(&tmp);
    for i in 0..count {
        let key = format!("{}", i).into_bytes();
        let got = store.engine().get(&key, RecordKind::Normal).unwrap();
        if i % 16 == 0 {
            assert_eq!(got, None, "key {} should be deleted", i);
        } else {
            assert_eq!(got, Some(key.clone()), "key {}", i);
        }
    }
    store.close().unwrap();

    assert!(tmp.path().join("data").join("data").join("merge-hint").exists());
    assert!(!tmp.path().join("merge").exists());
}

#[test]
fn provenance_values_in_insertion_order() {
    let tmp = TempDir::new().unwrap();
    {
        let store =
            BlockStore::open(tmp.path().join("data"), tmp.path().join("merge"), true).unwrap();
        for i in 0..1000 {
            let value = format!("prov-{}", i).into_bytes();
            store.set_prov_data(b"42", &value).unwrap();
        }
        store.close().unwrap();
    }

    let store = BlockStore::open(tmp.path().join("data"), tmp.path().join("merge"), true).unwrap();
    let values = store.get_prov_data("42").unwrap();
    assert_eq!(values.len(), 1000);
    for (i, value) in values.iter().enumerate() {
        assert_eq!(value, format!("prov-{}", i).as_bytes(), "value {}", i);
    }

    store.delete_prov_data("42").unwrap();
    assert!(store.get_prov_data("42").unwrap().is_empty());
    store.close().unwrap();
}
