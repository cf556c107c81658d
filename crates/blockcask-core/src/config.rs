//! Engine configuration and on-disk layout constants.

use std::path::PathBuf;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

/// Subdirectory for full block records
pub const BLOCK_DATA_DIR: &str = "block";
/// Subdirectory for block-part records
pub const BLOCK_PART_DIR: &str = "blockPart";
/// Subdirectory for generic records
pub const DATA_FILE_DIR: &str = "data";
/// Subdirectory for per-entity provenance logs
pub const PROVENANCE_DIR: &str = "provenance";

pub const BLOCK_DATA_SUFFIX: &str = ".block";
pub const BLOCK_PART_SUFFIX: &str = ".part";
pub const DATA_FILE_SUFFIX: &str = ".data";
pub const PROVENANCE_SUFFIX: &str = ".prov";

/// Engine configuration.
///
/// `Options::default()` carries the tuning the engine ships with; embedders
/// normally override only the paths and the opt-in features.
#[derive(Debug, Clone)]
pub struct Options {
    /// B-tree fan-out hint for the in-memory index. Advisory: the standard
    /// library B-tree picks its own node size.
    pub btree_degree_for_index: usize,
    /// B-tree fan-out hint for the memtable. Advisory, as above.
    pub btree_degree_for_mem_table: usize,
    /// Segment rotation threshold in bytes
    pub disk_file_size: u64,
    /// Root directory for segment files, provenance logs and the WAL
    pub data_dir: PathBuf,

    /// Staging directory for merge output
    pub merge_dir: PathBuf,
    /// Name of the hint file produced by merge
    pub merge_hint_filename: String,
    /// Name of the marker file that records the merge cutoff
    pub merge_finish_filename: String,

    /// Memtable flush threshold in bytes
    pub mem_table_size: usize,
    /// Path of the write-ahead log
    pub wal_file_path: PathBuf,
    /// Disable the WAL entirely
    pub wal_disabled: bool,

    /// Enable the admission cache for full block reads
    pub enable_block_data_cache: bool,
    /// Probation queue byte limit
    pub probation_limit: usize,
    /// Protection queue byte limit
    pub protection_limit: usize,

    /// Enable the per-entity provenance store
    pub enable_prov: bool,
    /// Depth of the provenance writer queue
    pub prov_write_chan_size: usize,

    /// Number of index shards; must be a power of two
    pub mem_index_num: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            btree_degree_for_index: 32,
            btree_degree_for_mem_table: 32,
            disk_file_size: 64 * MB as u64,
            data_dir: PathBuf::from("/tmp/blockcask/data"),
            merge_dir: PathBuf::from("/tmp/blockcask/merge"),
            merge_hint_filename: "merge-hint".to_string(),
            merge_finish_filename: "merge-finish".to_string(),
            mem_table_size: 4 * GB,
            wal_file_path: PathBuf::from("/tmp/blockcask/data/wal.log"),
            wal_disabled: true,
            enable_block_data_cache: false,
            probation_limit: 200 * MB,
            protection_limit: 800 * MB,
            enable_prov: false,
            prov_write_chan_size: 4 * 1024,
            mem_index_num: 4,
        }
    }
}

impl Options {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.disk_file_size == 0 {
            return Err("disk_file_size must be > 0".into());
        }
        if self.mem_table_size == 0 {
            return Err("mem_table_size must be > 0".into());
        }
        if self.mem_index_num == 0 || !self.mem_index_num.is_power_of_two() {
            return Err("mem_index_num must be a power of two".into());
        }
        if self.enable_prov && self.prov_write_chan_size == 0 {
            return Err("prov_write_chan_size must be > 0".into());
        }
        if !self.wal_disabled && self.wal_file_path.as_os_str().is_empty() {
            return Err("wal_file_path must be set when the WAL is enabled".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn test_shard_count_must_be_power_of_two() {
        let mut opts = Options::default();
        opts.mem_index_num = 3;
        assert!(opts.validate().is_err());
        opts.mem_index_num = 8;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut opts = Options::default();
        opts.disk_file_size = 0;
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.mem_table_size = 0;
        assert!(opts.validate().is_err());
    }
}
