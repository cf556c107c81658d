//! Core storage engine — binds the memtables, the WAL, the segment lists,
//! the sharded index and the provenance store.
//!
//! **Write path**: WAL append, then live memtable insert. When the memtable
//! crosses its size threshold and no flush is running, it is swapped to the
//! immutable slot and the background flush task is woken; the swap is
//! skipped while a flush is in flight, so `put` never blocks on flush
//! progress.
//!
//! **Read path**: live memtable, immutable memtable, then the sharded index
//! pointing at a `(filename, offset)` inside a segment file. Full block
//! reads consult the admission cache first when it is enabled.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::SlruCache;
use crate::config::{
    Options, BLOCK_DATA_DIR, BLOCK_DATA_SUFFIX, BLOCK_PART_DIR, BLOCK_PART_SUFFIX, DATA_FILE_DIR,
    DATA_FILE_SUFFIX, PROVENANCE_DIR, PROVENANCE_SUFFIX,
};
use crate::diskfile::DiskFile;
use crate::error::{CaskError, CaskResult};
use crate::index::ShardedIndex;
use crate::memtable::MemTable;
use crate::position::Position;
use crate::provenance::ProvStore;
use crate::record::{decode_stream, Record, RecordKind};
use crate::segment::{parse_segment_number, SegmentList};
use crate::wal::Wal;

/// State shared between caller threads and the background flush task.
pub(crate) struct Core {
    pub(crate) opts: Options,
    pub(crate) index: ShardedIndex,
    pub(crate) live: RwLock<Arc<MemTable>>,
    pub(crate) immutable: RwLock<Option<Arc<MemTable>>>,
    pub(crate) normal_files: SegmentList,
    pub(crate) block_files: SegmentList,
    pub(crate) part_files: SegmentList,
    pub(crate) wal: Option<Wal>,
    /// Binary semaphore. Holding the token grants the exclusive right to
    /// initiate a flush; the flush task returns it when the immutable
    /// memtable has been written out.
    pub(crate) flush_slot_tx: Sender<()>,
    pub(crate) flush_slot_rx: Receiver<()>,
    /// Memtable records processed by completed flushes.
    pub(crate) flushed_records: AtomicU64,
    /// Completed flush cycles.
    pub(crate) flush_cycles: AtomicU64,
}

pub struct Engine {
    pub(crate) core: Arc<Core>,
    /// Wakes the flush task. Dropped on close so the task exits.
    gen_immutable_tx: Mutex<Option<Sender<()>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    prov: Option<Arc<ProvStore>>,
    prov_tx: Mutex<Option<Sender<Record>>>,
    prov_handle: Mutex<Option<JoinHandle<()>>>,
    closed: Mutex<bool>,
    pub(crate) merging: Mutex<bool>,
}

impl Engine {
    /// Open the engine, recovering on-disk state into the index.
    ///
    /// Recovery replays the WAL into the live memtable, scans block and
    /// block-part segments, applies any finished merge left by a previous
    /// run, then rebuilds the generic-record index from the hint file and
    /// the segments the merge did not cover.
    pub fn open(opts: Options) -> CaskResult<Self> {
        opts.validate().map_err(|msg| CaskError::Io {
            path: Some(opts.data_dir.clone()),
            kind: std::io::ErrorKind::InvalidInput,
            message: msg,
        })?;

        std::fs::create_dir_all(&opts.data_dir).map_err(|e| CaskError::Io {
            path: Some(opts.data_dir.clone()),
            kind: e.kind(),
            message: format!("failed to create data directory: {}", e),
        })?;

        let cache = opts
            .enable_block_data_cache
            .then(|| SlruCache::new(opts.probation_limit, opts.protection_limit));

        let block_files = SegmentList::new(
            opts.data_dir.join(BLOCK_DATA_DIR),
            BLOCK_DATA_SUFFIX,
            opts.disk_file_size,
            cache,
        );
        let part_files = SegmentList::new(
            opts.data_dir.join(BLOCK_PART_DIR),
            BLOCK_PART_SUFFIX,
            opts.disk_file_size,
            None,
        );
        let normal_files = SegmentList::new(
            opts.data_dir.join(DATA_FILE_DIR),
            DATA_FILE_SUFFIX,
            opts.disk_file_size,
            None,
        );

        let (prov, prov_tx, prov_handle) = if opts.enable_prov {
            let store = Arc::new(ProvStore::open(
                opts.data_dir.join(PROVENANCE_DIR),
                PROVENANCE_SUFFIX,
            )?);
            store.register_existing()?;

            let (tx, rx) = bounded::<Record>(opts.prov_write_chan_size);
            let writer_store = Arc::clone(&store);
            let handle = std::thread::Builder::new()
                .name("blockcask-prov".to_string())
                .spawn(move || {
                    for record in rx.iter() {
                        if let Err(e) = writer_store.write(&record) {
                            panic!("provenance write failed: {}", e);
                        }
                    }
                })
                .map_err(|e| CaskError::Io {
                    path: None,
                    kind: e.kind(),
                    message: format!("failed to spawn provenance writer: {}", e),
                })?;
            (Some(store), Some(tx), Some(handle))
        } else {
            (None, None, None)
        };

        let wal = if opts.wal_disabled {
            None
        } else {
            Some(Wal::open(&opts.wal_file_path)?)
        };

        let (flush_slot_tx, flush_slot_rx) = bounded(1);
        flush_slot_tx.send(()).expect("fresh flush slot has capacity");

        let index = ShardedIndex::new(opts.mem_index_num);
        let core = Arc::new(Core {
            opts,
            index,
            live: RwLock::new(Arc::new(MemTable::new())),
            immutable: RwLock::new(None),
            normal_files,
            block_files,
            part_files,
            wal,
            flush_slot_tx,
            flush_slot_rx,
            flushed_records: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
        });

        load_block_classes(&core)?;
        replay_merge(&core)?;
        load_normal_class(&core)?;

        let (gen_tx, gen_rx) = bounded::<()>(0);
        let flush_core = Arc::clone(&core);
        let flush_handle = std::thread::Builder::new()
            .name("blockcask-flush".to_string())
            .spawn(move || crate::flush::run(flush_core, gen_rx))
            .map_err(|e| CaskError::Io {
                path: None,
                kind: e.kind(),
                message: format!("failed to spawn flush task: {}", e),
            })?;

        info!(
            data_dir = %core.opts.data_dir.display(),
            indexed = core.index.len(),
            "engine opened"
        );

        Ok(Self {
            core,
            gen_immutable_tx: Mutex::new(Some(gen_tx)),
            flush_handle: Mutex::new(Some(flush_handle)),
            prov,
            prov_tx: Mutex::new(prov_tx),
            prov_handle: Mutex::new(prov_handle),
            closed: Mutex::new(false),
            merging: Mutex::new(false),
        })
    }

    /// Write a record of the given kind.
    ///
    /// Provenance records bypass the WAL and the memtable entirely: they
    /// are enqueued to the dedicated writer and the call returns. Enqueueing
    /// blocks while the bounded queue is full, which is the back-pressure
    /// for provenance bursts.
    pub fn put(&self, key: &[u8], value: &[u8], kind: RecordKind) -> CaskResult<()> {
        let record = Record::new(key.to_vec(), value.to_vec(), kind);

        if kind == RecordKind::Provenance {
            let tx = self.prov_tx.lock().clone();
            match tx {
                Some(tx) => {
                    if tx.send(record).is_err() {
                        warn!("provenance record dropped: engine closed");
                    }
                }
                None => warn!("provenance record dropped: provenance store disabled"),
            }
            return Ok(());
        }

        let needs_rotate = {
            // the slot read lock is held across the WAL append and the
            // insert so a rotation cannot interleave between them
            let live = self.core.live.read();
            if let Some(wal) = &self.core.wal {
                wal.append(&record)?;
            }
            live.put(record);
            live.size() >= self.core.opts.mem_table_size
        };

        if needs_rotate {
            self.rotate_async()?;
        }
        Ok(())
    }

    /// Look up a key. Missing keys return `Ok(None)`, not an error. A
    /// tombstone still resident in a memtable reads back as an empty value.
    pub fn get(&self, key: &[u8], kind: RecordKind) -> CaskResult<Option<Vec<u8>>> {
        if let Some(value) = self.core.live.read().get(key) {
            return Ok(Some(value));
        }
        if let Some(imm) = self.core.immutable.read().clone() {
            if let Some(value) = imm.get(key) {
                return Ok(Some(value));
            }
        }

        let Some(pos) = self.core.index.get(key) else {
            return Ok(None);
        };

        let files = match kind {
            RecordKind::Normal | RecordKind::Delete => &self.core.normal_files,
            RecordKind::BlockData => {
                if self.core.opts.enable_block_data_cache {
                    if let Some(value) = self.core.block_files.get_cached(key) {
                        return Ok(Some(value));
                    }
                }
                &self.core.block_files
            }
            RecordKind::BlockPart => &self.core.part_files,
            RecordKind::Provenance => return Ok(None),
        };

        let file = files.file_for(&pos.filename)?;
        let (record, _) = file.read_record(pos.offset)?;

        if kind == RecordKind::BlockData && self.core.opts.enable_block_data_cache {
            self.core.block_files.put_cached(key, &record.value);
        }

        Ok(Some(record.value))
    }

    /// Write a tombstone for `key`. Deleting a missing key succeeds.
    pub fn delete(&self, key: &[u8]) -> CaskResult<()> {
        self.put(key, &[], RecordKind::Delete)
    }

    /// Read one block part by `(height, index)`.
    pub fn get_block_part(&self, height: u64, index: usize) -> CaskResult<Option<Vec<u8>>> {
        self.get(&part_key(height, index), RecordKind::BlockPart)
    }

    /// Read all parts of a block in index order. Parts that cannot be found
    /// leave their slot as `None`; the call still succeeds.
    pub fn get_block_parts(&self, height: u64, total: usize) -> CaskResult<Vec<Option<Vec<u8>>>> {
        let mut parts = vec![None; total];
        let mut positions: Vec<Position> = Vec::with_capacity(total);

        {
            let live = self.core.live.read();
            let immutable = self.core.immutable.read().clone();
            for (index, slot) in parts.iter_mut().enumerate() {
                let key = part_key(height, index);
                if let Some(value) = live.get(&key) {
                    *slot = Some(value);
                    continue;
                }
                if let Some(imm) = immutable.as_ref() {
                    if let Some(value) = imm.get(&key) {
                        *slot = Some(value);
                        continue;
                    }
                }
                if let Some(pos) = self.core.index.get(&key) {
                    positions.push(pos);
                }
            }
        }

        // The flush wrote keys in lexicographic order, so offsets for
        // ascending part indices are not monotonic within a file. Sorting by
        // (filename, offset) lets one large read per file cover the group.
        positions.sort_by(|a, b| a.filename.cmp(&b.filename).then(a.offset.cmp(&b.offset)));

        let mut start = 0;
        while start < positions.len() {
            let mut end = start + 1;
            while end < positions.len() && positions[end].filename == positions[start].filename {
                end += 1;
            }
            self.read_part_group(&positions[start..end], height, &mut parts)?;
            start = end;
        }

        Ok(parts)
    }

    /// Read a run of block parts that live in one segment file.
    ///
    /// With a single position the read extends to end of file; otherwise
    /// one read covers `[first, last)` and the record at `last` is read
    /// separately, since its length is not known in advance.
    fn read_part_group(
        &self,
        group: &[Position],
        height: u64,
        parts: &mut [Option<Vec<u8>>],
    ) -> CaskResult<()> {
        let file = self.core.part_files.file_for(&group[0].filename)?;
        let first = group[0].offset;
        let last = group[group.len() - 1].offset;

        let len = if group.len() == 1 {
            file.size()? - first
        } else {
            last - first
        };
        let mut buf = vec![0u8; len as usize];
        file.read_at(&mut buf, first)?;

        for record in decode_stream(&buf)? {
            place_part(&record, height, parts)?;
        }

        if group.len() > 1 {
            let (record, _) = file.read_record(last)?;
            place_part(&record, height, parts)?;
        }
        Ok(())
    }

    /// All provenance values logged for an entity, in insertion order.
    pub fn get_prov_data(&self, entity_id: &str) -> CaskResult<Vec<Vec<u8>>> {
        match &self.prov {
            Some(store) => store.get(entity_id),
            None => Ok(Vec::new()),
        }
    }

    /// Drop an entity's provenance log.
    pub fn delete_prov_data(&self, entity_id: &str) -> CaskResult<()> {
        match &self.prov {
            Some(store) => store.remove(entity_id),
            None => Ok(()),
        }
    }

    /// Non-blocking memtable rotation: if a flush is already in flight the
    /// swap is skipped and the live memtable keeps growing until the flush
    /// slot frees up.
    fn rotate_async(&self) -> CaskResult<()> {
        if self.core.flush_slot_rx.try_recv().is_err() {
            return Ok(());
        }
        self.swap_memtable()?;
        self.signal_flush();
        Ok(())
    }

    /// Blocking memtable rotation, used by close and merge.
    pub(crate) fn rotate_sync(&self) -> CaskResult<()> {
        if self.core.flush_slot_rx.recv().is_err() {
            return Ok(());
        }
        self.swap_memtable()?;
        self.signal_flush();
        Ok(())
    }

    /// Move the live memtable into the immutable slot and reset the WAL.
    /// Caller holds the flush-slot token.
    fn swap_memtable(&self) -> CaskResult<()> {
        let mut live = self.core.live.write();
        let old = std::mem::replace(&mut *live, Arc::new(MemTable::new()));
        *self.core.immutable.write() = Some(old);
        // writers hold the live slot's read lock across their WAL append,
        // so nothing can append during the rename/reopen window
        if let Some(wal) = &self.core.wal {
            wal.reset()?;
        }
        info!("rotated memtable to immutable");
        Ok(())
    }

    fn signal_flush(&self) {
        if let Some(tx) = self.gen_immutable_tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Memtable records written out by completed flushes since open.
    pub fn total_flushed(&self) -> u64 {
        self.core.flushed_records.load(Ordering::Relaxed)
    }

    /// Flush cycles completed since open.
    pub fn flush_cycles(&self) -> u64 {
        self.core.flush_cycles.load(Ordering::Relaxed)
    }

    /// Flush what is left in memory, stop the background tasks and close
    /// every file family. Closing twice is a no-op.
    pub fn close(&self) -> CaskResult<()> {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        if self.core.live.read().size() > 0 {
            self.rotate_sync()?;
        }

        // wait for any outstanding flush to finish
        let _ = self.core.flush_slot_rx.recv();

        *self.gen_immutable_tx.lock() = None;
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }

        // closing the queue drains it: the writer consumes what is buffered
        // and then exits
        *self.prov_tx.lock() = None;
        if let Some(handle) = self.prov_handle.lock().take() {
            let _ = handle.join();
        }

        self.core.normal_files.close();
        self.core.block_files.close();
        self.core.part_files.close();
        if let Some(store) = &self.prov {
            store.close();
        }

        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Key for the part of `height` at `index`: `P:<height>:<index>`.
pub fn part_key(height: u64, index: usize) -> Vec<u8> {
    format!("P:{}:{}", height, index).into_bytes()
}

fn parse_part_key(key: &[u8]) -> CaskResult<(u64, usize)> {
    let text = std::str::from_utf8(key).map_err(|_| invalid_part_key(key))?;
    let mut parts = text.split(':');
    let (Some(_), Some(height), Some(index), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid_part_key(key));
    };
    let height = height.parse().map_err(|_| invalid_part_key(key))?;
    let index = index.parse().map_err(|_| invalid_part_key(key))?;
    Ok((height, index))
}

fn invalid_part_key(key: &[u8]) -> CaskError {
    CaskError::InvalidPartKey { key: String::from_utf8_lossy(key).into_owned() }
}

/// Fill the slot a decoded part record belongs to. Records for another
/// height or an out-of-range index are skipped, not misfiled.
fn place_part(record: &Record, height: u64, parts: &mut [Option<Vec<u8>>]) -> CaskResult<()> {
    let (part_height, index) = parse_part_key(&record.key)?;
    if part_height == height && index < parts.len() {
        parts[index] = Some(record.value.clone());
    }
    Ok(())
}

fn load_block_classes(core: &Core) -> CaskResult<()> {
    if let Some(wal) = &core.wal {
        let records = wal.replay()?;
        if !records.is_empty() {
            info!(records = records.len(), "replayed WAL into live memtable");
        }
        let live = core.live.read();
        for record in records {
            live.put(record);
        }
    }

    for (subdir, list) in [
        (BLOCK_DATA_DIR, &core.block_files),
        (BLOCK_PART_DIR, &core.part_files),
    ] {
        let dir = core.opts.data_dir.join(subdir);
        let suffix = if subdir == BLOCK_DATA_DIR { BLOCK_DATA_SUFFIX } else { BLOCK_PART_SUFFIX };
        let names = list_segment_files(&dir, suffix)?;

        for (i, name) in names.iter().enumerate() {
            let number = parse_segment_number(name)?;
            let file = Arc::new(DiskFile::open(&dir, name)?);
            let entries = file.read_all_positions()?;

            if i == names.len() - 1 {
                list.install_active(file, number);
            } else {
                list.install_sealed(file, number)?;
            }
            apply_index_entries(core, entries);
        }
    }
    Ok(())
}

/// Apply a finished merge left on disk by a previous run: delete every
/// generic segment below the cutoff, then move the staged output (segments,
/// hint file and finish marker) into the data directory. A staging
/// directory without the finish marker is an aborted merge and is
/// discarded.
fn replay_merge(core: &Core) -> CaskResult<()> {
    let merge_dir = &core.opts.merge_dir;
    if !merge_dir.exists() {
        return Ok(());
    }

    let finish_path = merge_dir.join(&core.opts.merge_finish_filename);
    if !finish_path.exists() {
        info!("discarding incomplete merge directory");
        let _ = std::fs::remove_dir_all(merge_dir);
        return Ok(());
    }

    let cutoff = read_cutoff(&finish_path)?;
    info!(cutoff, "replaying finished merge");

    let data_dir = core.opts.data_dir.join(DATA_FILE_DIR);
    std::fs::create_dir_all(&data_dir).map_err(|e| CaskError::Io {
        path: Some(data_dir.clone()),
        kind: e.kind(),
        message: format!("failed to create data directory: {}", e),
    })?;

    for name in list_segment_files(&data_dir, DATA_FILE_SUFFIX)? {
        if parse_segment_number(&name)? < cutoff {
            std::fs::remove_file(data_dir.join(&name)).map_err(|e| CaskError::Io {
                path: Some(data_dir.join(&name)),
                kind: e.kind(),
                message: format!("failed to delete merged segment: {}", e),
            })?;
        }
    }

    // markers left by an earlier merge
    let _ = std::fs::remove_file(data_dir.join(&core.opts.merge_finish_filename));
    let _ = std::fs::remove_file(data_dir.join(&core.opts.merge_hint_filename));

    let entries = std::fs::read_dir(merge_dir).map_err(|e| CaskError::Io {
        path: Some(merge_dir.clone()),
        kind: e.kind(),
        message: format!("failed to read merge directory: {}", e),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(merge_dir.clone()),
            kind: e.kind(),
            message: format!("failed to read merge directory entry: {}", e),
        })?;
        std::fs::rename(entry.path(), data_dir.join(entry.file_name())).map_err(|e| {
            CaskError::Io {
                path: Some(entry.path()),
                kind: e.kind(),
                message: format!("failed to move merge output: {}", e),
            }
        })?;
    }

    let _ = std::fs::remove_dir_all(merge_dir);
    Ok(())
}

fn load_normal_class(core: &Core) -> CaskResult<()> {
    let dir = core.opts.data_dir.join(DATA_FILE_DIR);

    replay_hint_file(core, &dir)?;

    let finish_path = dir.join(&core.opts.merge_finish_filename);
    let cutoff = if finish_path.exists() { read_cutoff(&finish_path)? } else { 0 };

    let names = list_segment_files(&dir, DATA_FILE_SUFFIX)?;
    for (i, name) in names.iter().enumerate() {
        let number = parse_segment_number(name)?;
        let file = Arc::new(DiskFile::open(&dir, name)?);

        let entries = if number >= cutoff {
            // hint entries already cover segments below the cutoff
            Some(file.read_all_positions()?)
        } else {
            None
        };

        if i == names.len() - 1 {
            core.normal_files.install_active(file, number);
        } else {
            core.normal_files.install_sealed(file, number)?;
        }

        if let Some(entries) = entries {
            apply_index_entries(core, entries);
        }
    }
    Ok(())
}

fn replay_hint_file(core: &Core, dir: &Path) -> CaskResult<()> {
    let hint_path = dir.join(&core.opts.merge_hint_filename);
    let buf = match std::fs::read(&hint_path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(CaskError::Io {
                path: Some(hint_path),
                kind: e.kind(),
                message: format!("failed to read hint file: {}", e),
            })
        }
    };

    // a CRC failure here is fatal to open
    let records = decode_stream(&buf)?;
    info!(entries = records.len(), "replayed merge hint file");
    for record in records {
        let pos = Position::decode(&record.value)?;
        core.index.put(record.key, pos);
    }
    Ok(())
}

fn apply_index_entries(core: &Core, entries: Vec<(Record, Position)>) {
    for (record, pos) in entries {
        if record.kind == RecordKind::Delete {
            core.index.delete(&record.key);
        } else {
            core.index.put(record.key, pos);
        }
    }
}

fn read_cutoff(path: &Path) -> CaskResult<u64> {
    let text = std::fs::read_to_string(path).map_err(|e| CaskError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read merge-finish marker: {}", e),
    })?;
    text.trim().parse::<u64>().map_err(|_| CaskError::CorruptedRecord {
        offset: 0,
        reason: format!("merge-finish marker does not hold a file id: {:?}", text),
    })
}

/// Segment file names in `dir` carrying `suffix`, ascending. A missing
/// directory yields an empty list.
fn list_segment_files(dir: &Path, suffix: &str) -> CaskResult<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CaskError::Io {
                path: Some(dir.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to read segment directory: {}", e),
            })
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(suffix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
