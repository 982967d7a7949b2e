//! The binlogger: a locked-tail writer plus segment-spanning readers.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use sluice_proto::{Entity, Pos};

use crate::codec::{decode_frame, encode_record, Decoded, FRAME_OVERHEAD};
use crate::names::{is_dense, parse_segment_name, read_segment_names, search_index, segment_name};
use crate::StorageError;

/// Default rotation threshold: 512 MiB.
pub const DEFAULT_SEGMENT_SIZE: i64 = 512 * 1024 * 1024;

/// Tunables for a binlog directory.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Rotate once the tail segment reaches this many bytes.
    pub segment_size: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

struct Writer {
    /// `None` once the binlogger is closed; dropping the handle releases
    /// the tail lock.
    file: Option<File>,
    suffix: u64,
    offset: i64,
}

/// Append-only segmented binlog storage.
///
/// The writer is serialized under an internal mutex and holds an exclusive
/// file lock on the tail segment. Readers are independent and lock-free; a
/// reader that sees a valid CRC sees a complete record.
pub struct Binlogger {
    dir: PathBuf,
    opts: Options,
    writer: Mutex<Writer>,
}

impl Binlogger {
    /// Creates a fresh binlog directory with segment `binlog-0…0` and locks
    /// its tail.
    ///
    /// # Errors
    ///
    /// [`StorageError::DirExists`] if the directory already exists.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::create_with(dir, Options::default())
    }

    /// [`Binlogger::create`] with explicit options.
    pub fn create_with(dir: impl Into<PathBuf>, opts: Options) -> Result<Self, StorageError> {
        let dir = dir.into();
        if dir.exists() {
            return Err(StorageError::DirExists(dir));
        }
        std::fs::create_dir_all(&dir)?;
        let file = lock_segment(&dir.join(segment_name(0)), true)?;
        Ok(Self {
            dir,
            opts,
            writer: Mutex::new(Writer {
                file: Some(file),
                suffix: 0,
                offset: 0,
            }),
        })
    }

    /// Reopens an existing binlog directory: validates that the segment
    /// sequence is dense, locks the highest-numbered file, seeks to its end.
    ///
    /// # Errors
    ///
    /// [`StorageError::FileNotFound`] when the directory holds no segments,
    /// [`StorageError::SparseSequence`] when suffixes have gaps,
    /// [`StorageError::Locked`] when another writer holds the tail.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with(dir, Options::default())
    }

    /// [`Binlogger::open`] with explicit options.
    pub fn open_with(dir: impl Into<PathBuf>, opts: Options) -> Result<Self, StorageError> {
        let dir = dir.into();
        let names = match read_segment_names(&dir) {
            Ok(names) => names,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound(0))
            }
            Err(e) => return Err(e.into()),
        };
        let Some(last) = names.last() else {
            return Err(StorageError::FileNotFound(0));
        };
        if !is_dense(&names) {
            return Err(StorageError::SparseSequence(dir));
        }
        let suffix = parse_segment_name(last)
            .ok_or_else(|| StorageError::SparseSequence(dir.clone()))?;

        let mut file = lock_segment(&dir.join(last), false)?;
        let offset = i64::try_from(file.seek(SeekFrom::End(0))?)
            .map_err(|_| StorageError::InvalidArgument("segment larger than i64".into()))?;
        Ok(Self {
            dir,
            opts,
            writer: Mutex::new(Writer {
                file: Some(file),
                suffix,
                offset,
            }),
        })
    }

    /// Opens the directory if it holds segments, creates it otherwise.
    pub fn open_or_create(dir: impl Into<PathBuf>, opts: Options) -> Result<Self, StorageError> {
        let dir = dir.into();
        match Self::open_with(&dir, opts) {
            Err(StorageError::FileNotFound(_)) => Self::create_with(dir, opts),
            other => other,
        }
    }

    /// The directory this binlogger owns.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one framed payload and returns the post-write position.
    ///
    /// Rotation is lazy: when the tail has already reached the segment size
    /// a new segment is allocated and locked before the write, so a full
    /// tail never gains another record. Empty payloads are ignored.
    ///
    /// # Errors
    ///
    /// Any disk error is fatal to the writer and surfaced to the caller.
    pub fn write_tail(&self, payload: &[u8]) -> Result<Pos, StorageError> {
        let mut w = self.writer.lock();
        if w.file.is_none() {
            return Err(StorageError::Closed);
        }
        if payload.is_empty() {
            return Ok(Pos {
                suffix: w.suffix,
                offset: w.offset,
            });
        }

        if w.offset >= self.opts.segment_size {
            self.rotate(&mut w)?;
        }

        let file = w.file.as_mut().ok_or(StorageError::Closed)?;
        let written = encode_record(file, payload)?;
        file.flush()?;
        w.offset += written;
        Ok(Pos {
            suffix: w.suffix,
            offset: w.offset,
        })
    }

    /// The position the next record will end at on the current tail.
    #[must_use]
    pub fn tail_pos(&self) -> Pos {
        let w = self.writer.lock();
        Pos {
            suffix: w.suffix,
            offset: w.offset,
        }
    }

    fn rotate(&self, w: &mut Writer) -> Result<(), StorageError> {
        let next = w.suffix + 1;
        let file = lock_segment(&self.dir.join(segment_name(next)), true)?;
        // Dropping the previous handle releases its lock.
        w.file = Some(file);
        w.suffix = next;
        w.offset = 0;
        tracing::info!(dir = %self.dir.display(), suffix = next, "rotated binlog segment");
        Ok(())
    }

    /// Streaming reader starting at `from`. Each yielded entity carries the
    /// position of its own end; iteration crosses segment boundaries on
    /// clean EOF and stops at the first corruption or truncation.
    ///
    /// # Errors
    ///
    /// [`StorageError::FileNotFound`] when no segment has `from.suffix`.
    pub fn iter_from(&self, from: Pos) -> Result<EntityIter, StorageError> {
        let names = read_segment_names(&self.dir)?;
        let start = search_index(&names, from.suffix)
            .ok_or(StorageError::FileNotFound(from.suffix))?;
        Ok(EntityIter {
            dir: self.dir.clone(),
            names,
            idx: start,
            reader: None,
            suffix: from.suffix,
            offset: from.offset,
            done: false,
        })
    }

    /// Reads up to `n` entities starting at `from`.
    ///
    /// A truncated frame at the end of the log stops the batch without an
    /// error; the record is not yet durable and the next poll picks it up.
    /// Corruption of a committed record is surfaced.
    pub fn read_from(&self, from: Pos, n: usize) -> Result<Vec<Entity>, StorageError> {
        let mut out = Vec::new();
        for item in self.iter_from(from)?.take(n) {
            match item {
                Ok(entity) => out.push(entity),
                Err(e) if e.is_unexpected_eof() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Streams decoded records from `from` forward, invoking `send` per
    /// record, until the end of the log or cancellation. Returns the
    /// position after the last delivered record.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnexpectedEof`] when the log ends mid-frame (retry
    /// later from the last delivered position); [`StorageError::Corruption`]
    /// is unrecoverable.
    pub fn walk(
        &self,
        token: &CancellationToken,
        from: Pos,
        mut send: impl FnMut(&Entity) -> Result<(), StorageError>,
    ) -> Result<Pos, StorageError> {
        let mut latest = from.clone();
        for item in self.iter_from(from)? {
            if token.is_cancelled() {
                return Ok(latest);
            }
            let entity = item?;
            if let Some(pos) = &entity.pos {
                latest = pos.clone();
            }
            send(&entity)?;
        }
        Ok(latest)
    }

    /// Deletes segments that are both older than `older_than` and strictly
    /// below `keep_from.suffix`. The tail segment is never deleted.
    pub fn gc(&self, older_than: Duration, keep_from: Pos) {
        let names = match read_segment_names(&self.dir) {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "gc: list segments failed");
                return;
            }
        };
        if names.is_empty() {
            return;
        }
        let now = SystemTime::now();
        for name in &names[..names.len() - 1] {
            let Some(suffix) = parse_segment_name(name) else {
                continue;
            };
            if suffix >= keep_from.suffix {
                continue;
            }
            let path = self.dir.join(name);
            let expired = match path.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => now.duration_since(mtime).map_or(false, |age| age > older_than),
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "gc: stat failed");
                    continue;
                }
            };
            if !expired {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(file = %path.display(), "gc: removed binlog segment"),
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "gc: remove failed");
                }
            }
        }
    }

    /// Releases the tail lock. Later writes fail with [`StorageError::Closed`].
    pub fn close(&self) -> Result<(), StorageError> {
        let mut w = self.writer.lock();
        if let Some(mut file) = w.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

fn lock_segment(path: &Path, create: bool) -> Result<File, StorageError> {
    let file = OpenOptions::new()
        .write(true)
        .create(create)
        .open(path)?;
    file.try_lock_exclusive()
        .map_err(|_| StorageError::Locked(path.to_path_buf()))?;
    Ok(file)
}

/// Iterator over framed entities, crossing segment boundaries.
pub struct EntityIter {
    dir: PathBuf,
    names: Vec<String>,
    idx: usize,
    reader: Option<BufReader<File>>,
    /// Segment suffix of the cursor.
    suffix: u64,
    /// Offset after the last yielded record; the next frame starts here.
    offset: i64,
    done: bool,
}

impl EntityIter {
    fn open_current(&mut self) -> Result<(), StorageError> {
        let name = &self.names[self.idx];
        let mut file = File::open(self.dir.join(name))?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(
                u64::try_from(self.offset)
                    .map_err(|_| StorageError::InvalidArgument("negative offset".into()))?,
            ))?;
        }
        self.reader = Some(BufReader::new(file));
        Ok(())
    }
}

impl Iterator for EntityIter {
    type Item = Result<Entity, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.reader.is_none() {
                if let Err(e) = self.open_current() {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            let reader = self.reader.as_mut()?;
            match decode_frame(reader) {
                Ok(Decoded::Record(payload)) => {
                    self.offset += payload.len() as i64 + FRAME_OVERHEAD;
                    return Some(Ok(Entity {
                        pos: Some(Pos {
                            suffix: self.suffix,
                            offset: self.offset,
                        }),
                        payload,
                    }));
                }
                Ok(Decoded::Eof) => {
                    // Clean boundary: advance to the next segment if any.
                    if self.idx + 1 >= self.names.len() {
                        self.done = true;
                        return None;
                    }
                    self.idx += 1;
                    self.suffix = parse_segment_name(&self.names[self.idx])
                        .unwrap_or(self.suffix + 1);
                    self.offset = 0;
                    self.reader = None;
                }
                Ok(Decoded::Truncated) => {
                    self.done = true;
                    return Some(Err(StorageError::UnexpectedEof {
                        file: self.names[self.idx].clone(),
                        offset: self.offset,
                    }));
                }
                Ok(Decoded::Corrupt(reason)) => {
                    self.done = true;
                    return Some(Err(StorageError::Corruption {
                        file: self.names[self.idx].clone(),
                        offset: self.offset,
                        reason: reason.to_string(),
                    }));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}
