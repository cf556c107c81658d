//! Per-entity append-only provenance logs.
//!
//! Each entity id owns one `<entityId>.prov` file holding a concatenation of
//! encoded records whose key is the entity id and whose value is opaque to
//! the engine. Writes are serialized by a single consumer task fed from a
//! bounded queue; this store only performs the file work.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{CaskError, CaskResult};
use crate::record::{decode_stream, Record};

pub struct ProvStore {
    dir: PathBuf,
    suffix: &'static str,
    files: RwLock<HashMap<String, File>>,
}

impl ProvStore {
    /// Open the store rooted at `dir`, creating the directory if missing.
    pub fn open(dir: PathBuf, suffix: &'static str) -> CaskResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| CaskError::Io {
            path: Some(dir.clone()),
            kind: e.kind(),
            message: format!("failed to create provenance directory: {}", e),
        })?;
        Ok(Self { dir, suffix, files: RwLock::new(HashMap::new()) })
    }

    /// Scan the directory and open a handle for every existing entity file.
    /// Called once during engine recovery.
    pub fn register_existing(&self) -> CaskResult<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(CaskError::Io {
                    path: Some(self.dir.clone()),
                    kind: e.kind(),
                    message: format!("failed to read provenance directory: {}", e),
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| CaskError::Io {
                path: Some(self.dir.clone()),
                kind: e.kind(),
                message: format!("failed to read directory entry: {}", e),
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(self.suffix) {
                continue;
            }

            let mut parts = name.split('.');
            let (Some(entity_id), Some(_), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(CaskError::InvalidProvenanceFileName { name: name.to_string() });
            };

            let file = open_append(&self.dir.join(name))?;
            self.files.write().insert(entity_id.to_string(), file);
        }

        Ok(())
    }

    /// Append one record to the entity file named by the record's key,
    /// opening the file on first use.
    pub fn write(&self, record: &Record) -> CaskResult<()> {
        let entity_id = String::from_utf8_lossy(&record.key).into_owned();
        let enc = record.encode();

        let mut files = self.files.write();
        if !files.contains_key(&entity_id) {
            let path = self.dir.join(format!("{}{}", entity_id, self.suffix));
            files.insert(entity_id.clone(), open_append(&path)?);
        }
        let file = files.get(&entity_id).expect("handle just inserted");
        (&*file).write_all(&enc).map_err(|e| CaskError::Io {
            path: Some(self.dir.join(format!("{}{}", entity_id, self.suffix))),
            kind: e.kind(),
            message: format!("provenance append failed: {}", e),
        })
    }

    /// All values logged for an entity, in insertion order. An unknown
    /// entity yields an empty list.
    pub fn get(&self, entity_id: &str) -> CaskResult<Vec<Vec<u8>>> {
        let files = self.files.read();
        let Some(file) = files.get(entity_id) else {
            return Ok(Vec::new());
        };

        let size = file
            .metadata()
            .map_err(|e| CaskError::Io {
                path: Some(self.dir.clone()),
                kind: e.kind(),
                message: format!("failed to stat provenance file: {}", e),
            })?
            .len();

        let mut buf = vec![0u8; size as usize];
        if size > 0 {
            file.read_exact_at(&mut buf, 0).map_err(|e| CaskError::Io {
                path: Some(self.dir.clone()),
                kind: e.kind(),
                message: format!("failed to read provenance file: {}", e),
            })?;
        }

        Ok(decode_stream(&buf)?.into_iter().map(|r| r.value).collect())
    }

    /// Delete an entity's log. The handle is closed first, then the file is
    /// renamed to a unique temporary name so concurrent readers can finish,
    /// and deleted in the background. Removing an unknown entity succeeds.
    pub fn remove(&self, entity_id: &str) -> CaskResult<()> {
        let mut files = self.files.write();
        if files.remove(entity_id).is_none() {
            return Ok(());
        }
        drop(files);

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = self.dir.join(format!("{}{}", entity_id, self.suffix));
        let retired = self.dir.join(format!("{}-{}.removed", entity_id, stamp));

        std::fs::rename(&path, &retired).map_err(|e| CaskError::Io {
            path: Some(path),
            kind: e.kind(),
            message: format!("provenance rename failed: {}", e),
        })?;

        std::thread::spawn(move || {
            let _ = std::fs::remove_file(retired);
        });

        Ok(())
    }

    /// Close every handle.
    pub fn close(&self) {
        self.files.write().clear();
    }
}

fn open_append(path: &PathBuf) -> CaskResult<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| CaskError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("failed to open provenance file: {}", e),
        })
}
