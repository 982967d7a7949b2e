//! Append-only segmented binlog storage for the pump.
//!
//! A binlog directory holds files named `binlog-%016d`. Records are framed
//! as `magic(4) | payload_len(8) | payload | crc32c(4)`, all little-endian,
//! 16 bytes of framing per record. The writer holds an exclusive OS-level
//! lock on the current tail segment; readers open segments read-only and
//! advance across segment boundaries on clean EOF.
//!
//! A record position is the offset of the first byte *after* the record, so
//! streaming resumes exactly at the position of the last delivered entity.

#![warn(clippy::all)]

mod binlogger;
mod codec;
mod names;

use std::path::PathBuf;

pub use binlogger::{Binlogger, EntityIter, Options, DEFAULT_SEGMENT_SIZE};
pub use codec::{decode_record, encode_record, FRAME_OVERHEAD, MAGIC};
pub use names::{parse_segment_name, read_segment_names, search_index, segment_name};

/// Errors from binlog storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure. Fatal to the writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `create` was called on an existing directory.
    #[error("binlog directory already exists: {0}")]
    DirExists(PathBuf),

    /// No segment covers the requested position.
    #[error("no binlog segment for suffix {0}")]
    FileNotFound(u64),

    /// The segment name sequence has gaps; the directory was tampered with.
    #[error("binlog segment sequence is not dense in {0}")]
    SparseSequence(PathBuf),

    /// Another writer holds the tail lock.
    #[error("binlog tail is locked by another writer: {0}")]
    Locked(PathBuf),

    /// A committed record failed its magic or CRC check.
    #[error("corrupt record in {file} at offset {offset}: {reason}")]
    Corruption {
        /// Segment file name.
        file: String,
        /// Offset of the first byte of the bad frame.
        offset: i64,
        /// What failed: magic, length, or CRC.
        reason: String,
    },

    /// A frame was cut short. At the tail this means "not yet durable";
    /// callers retry from the same position.
    #[error("unexpected end of file in {file} at offset {offset}")]
    UnexpectedEof {
        /// Segment file name.
        file: String,
        /// Offset of the first byte of the partial frame.
        offset: i64,
    },

    /// Caller error, e.g. a negative read count.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The binlogger was closed.
    #[error("binlogger is closed")]
    Closed,
}

impl StorageError {
    /// True for the retryable truncated-tail case.
    #[must_use]
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof { .. })
    }
}
