//! Error types for blockcask operations
//!
//! Every fallible operation in the engine returns a `CaskError`. Variants
//! carry enough context (file, offset, expected/actual checksum) to diagnose
//! a corrupted store without a debugger.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// blockcask error types with detailed context
#[derive(Debug)]
pub enum CaskError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A decoded record's CRC-32 does not match the stored value.
    /// Truncated tails surface as this error too, since a partial record
    /// cannot be distinguished from a corrupted one.
    CrcMismatch {
        /// Checksum stored in the record header
        expected: u32,
        /// Checksum computed over the record bytes
        actual: u32,
        /// Byte offset of the record start
        offset: u64,
    },

    /// A positional read reached at or beyond the end of the file
    EndOfFile {
        /// Requested offset
        offset: u64,
        /// Actual file size
        size: u64,
    },

    /// A record header carries a type byte or size outside the defined range
    CorruptedRecord {
        /// Offset of the record start
        offset: u64,
        /// Description of what failed to parse
        reason: String,
    },

    /// A filename does not match the `NNNNNNNN.<suffix>` segment convention
    InvalidSegmentName {
        /// The offending filename
        name: String,
    },

    /// A position references a file no segment list has registered
    SegmentNotFound {
        /// The filename from the position
        filename: String,
    },

    /// A block-part key does not parse as `P:<height>:<index>`
    InvalidPartKey {
        /// The offending key, lossily decoded
        key: String,
    },

    /// A provenance file's name has no `.`-separated entity prefix
    InvalidProvenanceFileName {
        /// The offending filename
        name: String,
    },

    /// The high-level adapter rejects empty keys
    EmptyKey,

    /// A single encoded record exceeds the segment rotation threshold
    SegmentTooLarge {
        /// Encoded record size
        record_size: u64,
        /// Configured segment size limit
        limit: u64,
    },
}

impl fmt::Display for CaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaskError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            CaskError::CrcMismatch { expected, actual, offset } => {
                write!(f, "CRC mismatch at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       offset, expected, actual)
            }

            CaskError::EndOfFile { offset, size } => {
                write!(f, "read at offset {} beyond end of file ({} bytes)", offset, size)
            }

            CaskError::CorruptedRecord { offset, reason } => {
                write!(f, "corrupted record at offset {}: {}", offset, reason)
            }

            CaskError::InvalidSegmentName { name } => {
                write!(f, "invalid segment file name: {}", name)
            }

            CaskError::SegmentNotFound { filename } => {
                write!(f, "segment file not registered: {}", filename)
            }

            CaskError::InvalidPartKey { key } => {
                write!(f, "invalid block-part key: {}", key)
            }

            CaskError::InvalidProvenanceFileName { name } => {
                write!(f, "invalid provenance file name: {}", name)
            }

            CaskError::EmptyKey => {
                write!(f, "empty key is not allowed")
            }

            CaskError::SegmentTooLarge { record_size, limit } => {
                write!(f, "record of {} bytes exceeds segment size limit of {} bytes",
                       record_size, limit)
            }
        }
    }
}

impl Error for CaskError {}

/// Convert std::io::Error to CaskError::Io
impl From<std::io::Error> for CaskError {
    fn from(err: std::io::Error) -> Self {
        CaskError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for blockcask operations
pub type CaskResult<T> = Result<T, CaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaskError::CrcMismatch {
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("CRC mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cask_err: CaskError = io_err.into();

        match cask_err {
            CaskError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_segment_name_display() {
        let err = CaskError::InvalidSegmentName { name: "garbage.tmp".to_string() };
        assert!(format!("{}", err).contains("garbage.tmp"));
    }
}
