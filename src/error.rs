//! Error types for the krati storage core.

use std::fmt;
use std::io;

/// The result type used throughout krati.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for store operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// The store has been closed; no further operations are accepted.
    StoreClosed,

    /// An index was outside the configured capacity.
    IndexOutOfRange {
        /// The offending index.
        index: u32,
        /// The array length.
        length: u32,
    },

    /// The current segment has insufficient room for an append.
    ///
    /// Internal control-flow signal; the write loop recovers by rotating
    /// to a fresh segment.
    SegmentOverflow,

    /// An append was attempted on a sealed segment.
    ///
    /// Internal control-flow signal, like [`Error::SegmentOverflow`].
    SegmentReadOnly,

    /// The segment id space is exhausted.
    OutOfSegments,

    /// A payload checksum mismatch was detected.
    DataCorrupted {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// A redo-entry file failed CRC, magic or version validation.
    RedoCorrupted(String),

    /// The on-disk array length disagrees with the configured capacity.
    CapacityMismatch {
        /// The capacity requested by configuration.
        expected: u32,
        /// The length recorded on disk.
        actual: u32,
    },

    /// An invalid argument was provided.
    InvalidArgument(String),

    /// An internal error occurred.
    Internal(String),
}

impl Error {
    /// Creates a new redo-corruption error.
    pub fn redo_corrupted(msg: impl Into<String>) -> Self {
        Error::RedoCorrupted(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::StoreClosed => write!(f, "Store closed"),
            Error::IndexOutOfRange { index, length } => {
                write!(f, "Index out of range: {} not in [0, {})", index, length)
            }
            Error::SegmentOverflow => write!(f, "Segment overflow"),
            Error::SegmentReadOnly => write!(f, "Segment is read-only"),
            Error::OutOfSegments => write!(f, "Segment id space exhausted"),
            Error::DataCorrupted { expected, actual } => {
                write!(f, "Data corrupted: checksum expected {:#x}, got {:#x}", expected, actual)
            }
            Error::RedoCorrupted(msg) => write!(f, "Redo log corrupted: {}", msg),
            Error::CapacityMismatch { expected, actual } => {
                write!(f, "Capacity mismatch: expected {}, found {}", expected, actual)
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DataCorrupted { expected: 0x12345678, actual: 0x87654321 };
        assert!(err.to_string().contains("0x12345678"));
        assert!(err.to_string().contains("0x87654321"));

        let err = Error::IndexOutOfRange { index: 9, length: 8 };
        assert_eq!(err.to_string(), "Index out of range: 9 not in [0, 8)");

        let err = Error::redo_corrupted("bad magic");
        assert_eq!(err.to_string(), "Redo log corrupted: bad magic");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
