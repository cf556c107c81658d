//! Offline compaction of the generic record class.
//!
//! Live records from sealed segments are rewritten into a staging directory
//! alongside a hint file mapping each surviving key to its new position.
//! Writing the finish marker, which holds the cutoff file id, is the commit
//! point: the next open deletes every old segment below the cutoff and
//! moves the staged files into place. A crash before the marker leaves an
//! unfinished staging directory that recovery simply discards.

use std::fs::OpenOptions;
use std::io::Write;

use tracing::info;

use crate::config::DATA_FILE_SUFFIX;
use crate::engine::Engine;
use crate::error::{CaskError, CaskResult};
use crate::record::{Record, RecordKind};
use crate::segment::SegmentList;

impl Engine {
    /// Rewrite live generic records into a fresh segment generation.
    ///
    /// Serialized through the merging flag: a merge started while another
    /// is running is a no-op. Writes that arrive during the merge land in a
    /// segment at or above the cutoff and are untouched by it.
    pub fn merge(&self) -> CaskResult<()> {
        {
            let mut merging = self.merging.lock();
            if *merging {
                return Ok(());
            }
            *merging = true;
        }
        let result = self.merge_inner();
        *self.merging.lock() = false;
        result
    }

    fn merge_inner(&self) -> CaskResult<()> {
        // flush everything resident in memory first
        if self.core.live.read().size() > 0 {
            self.rotate_sync()?;
        }
        // take then return the flush slot: once acquired, no flush is running
        if self.core.flush_slot_rx.recv().is_ok() {
            let _ = self.core.flush_slot_tx.send(());
        }

        let opts = &self.core.opts;
        let _ = std::fs::remove_dir_all(&opts.merge_dir);

        let cutoff = self.core.normal_files.rotate_for_merge()?;

        std::fs::create_dir_all(&opts.merge_dir).map_err(|e| CaskError::Io {
            path: Some(opts.merge_dir.clone()),
            kind: e.kind(),
            message: format!("failed to create merge directory: {}", e),
        })?;

        let staged = SegmentList::new(
            opts.merge_dir.clone(),
            DATA_FILE_SUFFIX,
            opts.disk_file_size,
            None,
        );

        let hint_path = opts.merge_dir.join(&opts.merge_hint_filename);
        let hint = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&hint_path)
            .map_err(|e| CaskError::Io {
                path: Some(hint_path.clone()),
                kind: e.kind(),
                message: format!("failed to create hint file: {}", e),
            })?;

        let mut kept = 0u64;
        for id in self.core.normal_files.sealed_ids() {
            let Some(file) = self.core.normal_files.sealed_file(id) else {
                continue;
            };
            let mut offset = 0u64;
            loop {
                let (record, len) = match file.read_record(offset) {
                    Ok(v) => v,
                    Err(CaskError::EndOfFile { .. }) => break,
                    Err(e) => return Err(e),
                };

                // the live version of a key is the one its index entry
                // still points at
                let live = record.kind != RecordKind::Delete
                    && self
                        .core
                        .index
                        .get(&record.key)
                        .is_some_and(|pos| pos.filename == file.filename() && pos.offset == offset);

                if live {
                    let new_pos = staged.write(&record)?;
                    let hint_record =
                        Record::new(record.key, new_pos.encode(), RecordKind::Normal);
                    (&hint).write_all(&hint_record.encode()).map_err(|e| CaskError::Io {
                        path: Some(hint_path.clone()),
                        kind: e.kind(),
                        message: format!("hint append failed: {}", e),
                    })?;
                    kept += 1;
                }

                offset += len;
            }
        }

        // commit point
        let finish_path = opts.merge_dir.join(&opts.merge_finish_filename);
        std::fs::write(&finish_path, cutoff.to_string()).map_err(|e| CaskError::Io {
            path: Some(finish_path),
            kind: e.kind(),
            message: format!("failed to write merge-finish marker: {}", e),
        })?;

        staged.close();
        info!(cutoff, kept, "merge finished");
        Ok(())
    }
}
