//! Durable append-only log backing the Vector Store.
//!
//! Every `put` and `delete` is appended to a single log file before the
//! in-memory map changes, so a committed vector survives a crash. Opening
//! replays the log through a read-only memory map.
//!
//! # Storage Format
//!
//! - Header (16 bytes): magic `FVEC`, format version, dimension, reserved
//! - Records: `kind:u8 | item_id:u64 | version:u64 | timestamp_ms:i64`
//!   followed, for puts only, by `dimension` little-endian f32 values
//!
//! A record cut short by a crash, or a zero-filled tail left by one, is
//! truncated away on the next open. A failed append is rolled back to the
//! last complete record.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;

use crate::vector::types::{ItemId, VectorDimension, VectorError};

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes to identify vector log files.
const MAGIC_BYTES: &[u8; 4] = b"FVEC";

/// Number of bytes per f32 value.
const BYTES_PER_F32: usize = 4;

/// kind + item id + version + timestamp.
const RECORD_PREFIX_SIZE: usize = 1 + 8 + 8 + 8;

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// File name of the log inside the data directory.
pub const LOG_FILE_NAME: &str = "vectors.log";

/// Errors specific to the vector log.
#[derive(Error, Debug)]
pub enum VectorStorageError {
    #[error("IO error: {0}\nSuggestion: Check disk space and file permissions")]
    Io(#[from] io::Error),

    #[error(
        "Invalid storage format: {0}\nSuggestion: The vector log is corrupted; restore it from backup or delete it and re-ingest"
    )]
    InvalidFormat(String),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

impl From<VectorStorageError> for VectorError {
    fn from(err: VectorStorageError) -> Self {
        match err {
            VectorStorageError::Io(e) => VectorError::Storage(e),
            VectorStorageError::Vector(e) => e,
            VectorStorageError::InvalidFormat(msg) => {
                VectorError::Storage(io::Error::new(io::ErrorKind::InvalidData, msg))
            }
        }
    }
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayRecord {
    Put {
        item_id: ItemId,
        version: u64,
        inserted_at_ms: i64,
        vector: Vec<f32>,
    },
    Delete {
        item_id: ItemId,
        version: u64,
        deleted_at_ms: i64,
    },
}

/// A record to be written, borrowing its vector.
#[derive(Debug, Clone, Copy)]
pub enum LogEntry<'a> {
    Put {
        item_id: ItemId,
        version: u64,
        inserted_at_ms: i64,
        vector: &'a [f32],
    },
    Delete {
        item_id: ItemId,
        version: u64,
        deleted_at_ms: i64,
    },
}

/// Append-only vector log.
#[derive(Debug)]
pub struct VectorLog {
    path: PathBuf,
    file: File,
    dimension: VectorDimension,
    fsync: bool,
    record_count: u64,
    /// Byte length of the complete records written so far.
    len: u64,
    /// Set when a failed append could not be rolled back.
    failed: Option<String>,
}

impl VectorLog {
    /// Opens the log in `dir`, creating it if missing, and replays it.
    ///
    /// Returns the log positioned for appending plus every intact record in
    /// write order.
    pub fn open(
        dir: impl AsRef<Path>,
        dimension: VectorDimension,
        fsync: bool,
    ) -> Result<(Self, Vec<ReplayRecord>), VectorStorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len() as usize;
        let (records, valid_len) = if len == 0 {
            file.write_all(&header_bytes(dimension))?;
            file.flush()?;
            if fsync {
                file.sync_all()?;
            }
            (Vec::new(), HEADER_SIZE)
        } else {
            // SAFETY: the map is read-only and dropped before the file is
            // truncated or appended to.
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            let (records, valid_len) = replay(&mmap, dimension)?;
            drop(mmap);

            if valid_len < len {
                tracing::warn!(
                    "Truncating torn tail of {}: {} trailing bytes discarded",
                    path.display(),
                    len - valid_len
                );
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
            (records, valid_len)
        };

        tracing::debug!(
            "Replayed {} records from {}",
            records.len(),
            path.display()
        );

        Ok((
            Self {
                path,
                file,
                dimension,
                fsync,
                record_count: records.len() as u64,
                len: valid_len as u64,
                failed: None,
            },
            records,
        ))
    }

    /// Appends a put record.
    pub fn append_put(
        &mut self,
        item_id: ItemId,
        version: u64,
        inserted_at_ms: i64,
        vector: &[f32],
    ) -> Result<(), VectorStorageError> {
        self.append(LogEntry::Put {
            item_id,
            version,
            inserted_at_ms,
            vector,
        })
    }

    /// Appends a delete record carrying the version being retired.
    pub fn append_delete(
        &mut self,
        item_id: ItemId,
        version: u64,
        deleted_at_ms: i64,
    ) -> Result<(), VectorStorageError> {
        self.append(LogEntry::Delete {
            item_id,
            version,
            deleted_at_ms,
        })
    }

    fn append(&mut self, entry: LogEntry<'_>) -> Result<(), VectorStorageError> {
        self.append_with(entry, |file, buf| {
            file.write_all(buf)?;
            file.flush()
        })
    }

    /// Appends `entry` through `write`, truncating back to the last
    /// complete record if anything fails.
    fn append_with(
        &mut self,
        entry: LogEntry<'_>,
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<(), VectorStorageError> {
        if let Some(reason) = &self.failed {
            return Err(VectorStorageError::Io(io::Error::other(format!(
                "vector log {} is unusable: {reason}",
                self.path.display()
            ))));
        }

        let mut buf = Vec::with_capacity(RECORD_PREFIX_SIZE + self.dimension.get() * BYTES_PER_F32);
        encode_entry(&mut buf, entry, self.dimension)?;

        let written = write(&mut self.file, &buf).and_then(|()| {
            if self.fsync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.len) {
                tracing::error!(
                    "Could not roll back partial record in {}: {rollback}",
                    self.path.display()
                );
                self.failed = Some(format!("partial record left after: {e}"));
            }
            return Err(e.into());
        }

        self.len += buf.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    /// Rewrites the log so it holds exactly `entries`.
    ///
    /// The new log is written to a temporary file and renamed over the old
    /// one, so a crash mid-compaction leaves the previous log intact.
    pub fn compact<'a>(
        &mut self,
        entries: impl IntoIterator<Item = LogEntry<'a>>,
    ) -> Result<(), VectorStorageError> {
        let tmp_path = self.path.with_extension("log.compact");
        let mut buf = header_bytes(self.dimension).to_vec();
        let mut count = 0u64;
        for entry in entries {
            encode_entry(&mut buf, entry, self.dimension)?;
            count += 1;
        }

        let written = File::create(&tmp_path)
            .and_then(|mut tmp| {
                tmp.write_all(&buf)?;
                tmp.sync_all()
            })
            .and_then(|()| OpenOptions::new().read(true).append(true).open(&tmp_path));
        // The handle is opened before the rename so it follows the new file;
        // on failure the old log and handle stay in use.
        let file = match written {
            Ok(file) => file,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.file = file;
        self.len = buf.len() as u64;
        self.failed = None;
        let before = self.record_count;
        self.record_count = count;
        tracing::info!(
            "Compacted {}: {before} records -> {count}",
            self.path.display()
        );
        Ok(())
    }

    /// Number of records currently in the log.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log file in bytes.
    pub fn file_size(&self) -> Result<u64, io::Error> {
        Ok(self.file.metadata()?.len())
    }
}

fn header_bytes(dimension: VectorDimension) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC_BYTES);
    header[4..8].copy_from_slice(&STORAGE_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(dimension.get() as u32).to_le_bytes());
    header
}

fn encode_entry(
    buf: &mut Vec<u8>,
    entry: LogEntry<'_>,
    dimension: VectorDimension,
) -> Result<(), VectorStorageError> {
    match entry {
        LogEntry::Put {
            item_id,
            version,
            inserted_at_ms,
            vector,
        } => {
            dimension.validate_vector(vector)?;
            buf.push(KIND_PUT);
            buf.extend_from_slice(&item_id.to_bytes());
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&inserted_at_ms.to_le_bytes());
            for &value in vector {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        LogEntry::Delete {
            item_id,
            version,
            deleted_at_ms,
        } => {
            buf.push(KIND_DELETE);
            buf.extend_from_slice(&item_id.to_bytes());
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&deleted_at_ms.to_le_bytes());
        }
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Parses the header and all complete records.
///
/// Returns the records and the byte length of the intact prefix.
fn replay(
    mmap: &Mmap,
    dimension: VectorDimension,
) -> Result<(Vec<ReplayRecord>, usize), VectorStorageError> {
    if mmap.len() < HEADER_SIZE {
        return Err(VectorStorageError::InvalidFormat(
            "File too small to contain header".to_string(),
        ));
    }
    if &mmap[0..4] != MAGIC_BYTES {
        return Err(VectorStorageError::InvalidFormat(
            "Invalid magic bytes".to_string(),
        ));
    }

    let version = read_u32(mmap, 4);
    if version != STORAGE_VERSION {
        return Err(VectorError::VersionMismatch {
            expected: STORAGE_VERSION,
            actual: version,
        }
        .into());
    }

    let stored_dimension = read_u32(mmap, 8) as usize;
    if stored_dimension != dimension.get() {
        return Err(VectorError::DimensionMismatch {
            expected: dimension.get(),
            actual: stored_dimension,
        }
        .into());
    }

    let dim = dimension.get();
    let put_size = RECORD_PREFIX_SIZE + dim * BYTES_PER_F32;
    let mut records = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset < mmap.len() {
        let kind = mmap[offset];
        if kind == 0 && mmap[offset..].iter().all(|&b| b == 0) {
            break;
        }
        let record_size = match kind {
            KIND_PUT => put_size,
            KIND_DELETE => RECORD_PREFIX_SIZE,
            other => {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "Unknown record kind {other} at offset {offset}"
                )));
            }
        };
        if offset + record_size > mmap.len() {
            break;
        }

        let raw_id = read_u64(mmap, offset + 1);
        let item_id = ItemId::new(raw_id).ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("Zero item id at offset {offset}"))
        })?;
        let version = read_u64(mmap, offset + 9);
        let timestamp = read_u64(mmap, offset + 17) as i64;

        let record = if kind == KIND_PUT {
            let data = offset + RECORD_PREFIX_SIZE;
            let vector = (0..dim)
                .map(|i| f32::from_bits(read_u32(mmap, data + i * BYTES_PER_F32)))
                .collect();
            ReplayRecord::Put {
                item_id,
                version,
                inserted_at_ms: timestamp,
                vector,
            }
        } else {
            ReplayRecord::Delete {
                item_id,
                version,
                deleted_at_ms: timestamp,
            }
        };
        records.push(record);
        offset += record_size;
    }

    Ok((records, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dim(n: usize) -> VectorDimension {
        VectorDimension::new(n).unwrap()
    }

    fn id(n: u64) -> ItemId {
        ItemId::new(n).unwrap()
    }

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();

        {
            let (mut log, records) = VectorLog::open(temp_dir.path(), dim(3), false).unwrap();
            assert!(records.is_empty());
            log.append_put(id(1), 1, 1000, &[0.1, 0.2, 0.3]).unwrap();
            log.append_put(id(2), 1, 1001, &[0.4, 0.5, 0.6]).unwrap();
            log.append_delete(id(1), 1, 1002).unwrap();
            assert_eq!(log.record_count(), 3);
        }

        let (log, records) = VectorLog::open(temp_dir.path(), dim(3), false).unwrap();
        assert_eq!(log.record_count(), 3);
        assert_eq!(
            records[0],
            ReplayRecord::Put {
                item_id: id(1),
                version: 1,
                inserted_at_ms: 1000,
                vector: vec![0.1, 0.2, 0.3],
            }
        );
        assert_eq!(
            records[2],
            ReplayRecord::Delete {
                item_id: id(1),
                version: 1,
                deleted_at_ms: 1002,
            }
        );
    }

    #[test]
    fn test_dimension_validation_on_append() {
        let temp_dir = TempDir::new().unwrap();
        let (mut log, _) = VectorLog::open(temp_dir.path(), dim(3), false).unwrap();
        let result = log.append_put(id(1), 1, 0, &[0.1, 0.2]);
        assert!(matches!(
            result,
            Err(VectorStorageError::Vector(VectorError::DimensionMismatch { .. }))
        ));
        assert_eq!(log.record_count(), 0);
    }

    #[test]
    fn test_dimension_mismatch_on_open() {
        let temp_dir = TempDir::new().unwrap();
        drop(VectorLog::open(temp_dir.path(), dim(3), false).unwrap());

        let result = VectorLog::open(temp_dir.path(), dim(4), false);
        assert!(matches!(
            result,
            Err(VectorStorageError::Vector(VectorError::DimensionMismatch {
                expected: 4,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let (mut log, _) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
            log.append_put(id(7), 1, 0, &[1.0, 0.0]).unwrap();
            log.path().to_path_buf()
        };
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the next record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[KIND_PUT, 8, 0, 0]).unwrap();
        drop(file);

        let (mut log, records) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        log.append_put(id(8), 1, 0, &[0.0, 1.0]).unwrap();
        drop(log);
        let (_, records) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_zero_filled_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let (mut log, _) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
            log.append_put(id(7), 1, 0, &[1.0, 0.0]).unwrap();
            log.path().to_path_buf()
        };
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Space allocated but never written before the crash.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        drop(file);

        let (_, records) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);
    }

    #[test]
    fn test_garbage_after_zero_kind_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let (log, _) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
            log.path().to_path_buf()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 9, 0]).unwrap();
        drop(file);

        assert!(matches!(
            VectorLog::open(temp_dir.path(), dim(2), false),
            Err(VectorStorageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let (mut log, _) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        log.append_put(id(1), 1, 0, &[1.0, 0.0]).unwrap();
        let intact_len = log.file_size().unwrap();

        // Half the record reaches the file before the disk fills up.
        let result = log.append_with(
            LogEntry::Put {
                item_id: id(2),
                version: 1,
                inserted_at_ms: 0,
                vector: &[0.0, 1.0],
            },
            |file, buf| {
                file.write_all(&buf[..buf.len() / 2])?;
                Err(io::Error::other("no space left on device"))
            },
        );
        assert!(matches!(result, Err(VectorStorageError::Io(_))));
        assert_eq!(log.file_size().unwrap(), intact_len);
        assert_eq!(log.record_count(), 1);

        log.append_put(id(3), 1, 0, &[0.6, 0.8]).unwrap();
        drop(log);

        let (_, records) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1],
            ReplayRecord::Put {
                item_id: id(3),
                version: 1,
                inserted_at_ms: 0,
                vector: vec![0.6, 0.8],
            }
        );
    }

    #[test]
    fn test_corrupted_header() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOG_FILE_NAME), b"NOPE0000000000000000").unwrap();
        assert!(matches!(
            VectorLog::open(temp_dir.path(), dim(2), false),
            Err(VectorStorageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_compact_keeps_only_given_entries() {
        let temp_dir = TempDir::new().unwrap();
        let (mut log, _) = VectorLog::open(temp_dir.path(), dim(2), true).unwrap();
        for version in 1..=5 {
            log.append_put(id(1), version, 0, &[1.0, 0.0]).unwrap();
        }
        log.append_put(id(2), 1, 0, &[0.0, 1.0]).unwrap();
        log.append_delete(id(2), 1, 10).unwrap();
        let before = log.file_size().unwrap();

        log.compact([
            LogEntry::Put {
                item_id: id(1),
                version: 5,
                inserted_at_ms: 0,
                vector: &[1.0, 0.0],
            },
            LogEntry::Delete {
                item_id: id(2),
                version: 1,
                deleted_at_ms: 10,
            },
        ])
        .unwrap();
        assert_eq!(log.record_count(), 2);
        assert!(log.file_size().unwrap() < before);

        // Appends after compaction land in the new file.
        log.append_put(id(3), 1, 0, &[0.5, 0.5]).unwrap();
        drop(log);

        let (_, records) = VectorLog::open(temp_dir.path(), dim(2), false).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], ReplayRecord::Put { version: 5, .. }));
    }
}
