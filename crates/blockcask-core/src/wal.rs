//! Write-ahead log.
//!
//! A single append-only file holding every record accepted by `put` that is
//! not yet flushed to a sealed segment. It is replayed into the live
//! memtable at open and truncated on memtable rotation. Append failures are
//! escalated to the caller: a lost WAL record silently breaks recovery.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::info;

use crate::error::{CaskError, CaskResult};
use crate::record::{decode_stream, Record};

pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Wal {
    /// Open (creating if needed) the WAL at `path`.
    pub fn open(path: &Path) -> CaskResult<Self> {
        let file = open_append(path)?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    /// Append one encoded record.
    pub fn append(&self, record: &Record) -> CaskResult<()> {
        let file = self.file.lock();
        (&*file).write_all(&record.encode()).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL append failed: {}", e),
        })
    }

    /// Decode every record in the log, in append order. A CRC mismatch here
    /// is fatal to recovery and is returned as an error.
    pub fn replay(&self) -> CaskResult<Vec<Record>> {
        let file = self.file.lock();
        let size = file
            .metadata()
            .map_err(|e| CaskError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("failed to stat WAL: {}", e),
            })?
            .len();

        let mut buf = vec![0u8; size as usize];
        if size > 0 {
            file.read_exact_at(&mut buf, 0).map_err(|e| CaskError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("failed to read WAL: {}", e),
            })?;
        }

        decode_stream(&buf)
    }

    /// Atomically move the current log aside, schedule its deletion and
    /// reopen a fresh empty file.
    ///
    /// Called with the memtable rotation held exclusive, so no writer can
    /// append during the rename/reopen window.
    pub fn reset(&self) -> CaskResult<()> {
        let mut file = self.file.lock();

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let retired = self.path.with_file_name(format!("wal-{}.old", stamp));

        std::fs::rename(&self.path, &retired).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL rename failed: {}", e),
        })?;

        std::thread::spawn(move || {
            let _ = std::fs::remove_file(retired);
        });

        *file = open_append(&self.path)?;
        info!(path = %self.path.display(), "WAL reset");
        Ok(())
    }
}

fn open_append(path: &Path) -> CaskResult<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| CaskError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to open WAL: {}", e),
        })
}
