//! Background flush of the immutable memtable into segment files.
//!
//! The task sleeps on the wake channel; each signal means a frozen memtable
//! is waiting in the immutable slot. Records are written in ascending key
//! order to the segment list matching their kind, the index is updated per
//! record, and the flush-slot token is returned so the next rotation can
//! proceed.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::info;

use crate::engine::Core;
use crate::error::CaskResult;
use crate::memtable::MemTable;
use crate::record::RecordKind;

pub(crate) fn run(core: Arc<Core>, signal: Receiver<()>) {
    for _ in signal.iter() {
        let memtable = core
            .immutable
            .read()
            .clone()
            .expect("flush signal with no immutable memtable");

        if let Err(e) = flush_memtable(&core, &memtable) {
            // no caller to report to; a half-applied flush is unrecoverable
            panic!("memtable flush failed: {}", e);
        }

        let records = memtable.len();
        *core.immutable.write() = None;
        core.flushed_records.fetch_add(records as u64, Ordering::Relaxed);
        core.flush_cycles.fetch_add(1, Ordering::Relaxed);
        let _ = core.flush_slot_tx.send(());
        info!(records, "flushed immutable memtable");
    }
}

fn flush_memtable(core: &Core, memtable: &MemTable) -> CaskResult<()> {
    memtable.scan(|record| {
        match record.kind {
            RecordKind::Delete => core.index.delete(&record.key),
            RecordKind::Normal => {
                let pos = core.normal_files.write(record)?;
                core.index.put(record.key.clone(), pos);
            }
            RecordKind::BlockData => {
                let pos = core.block_files.write(record)?;
                core.index.put(record.key.clone(), pos);
            }
            RecordKind::BlockPart => {
                let pos = core.part_files.write(record)?;
                core.index.put(record.key.clone(), pos);
            }
            // provenance records never enter the memtable
            RecordKind::Provenance => {}
        }
        Ok(())
    })
}
