//! Append-only fact table file.

use crate::error::{Result, StoreError};
use crate::types::{Fact, FactHeader, Serial};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes for fact rows.
const ROW_MAGIC: &[u8; 4] = b"FCT\0";

/// Current row format version.
const ROW_VERSION: u8 = 1;

/// Set on the last row written by one publish call.
const FLAG_BATCH_END: u8 = 0b0000_0001;

/// A row recovered while opening the log.
#[derive(Debug)]
pub struct RecoveredRow {
    pub offset: u64,
    pub header: FactHeader,
}

/// Append-only fact table.
///
/// Rows of one publish call are written with a single `write_all`; the last
/// row carries a batch-end flag so a torn batch can be dropped on recovery.
pub struct FactLog {
    path: PathBuf,

    /// Append handle.
    writer: Mutex<File>,

    /// Separate handle for positioned reads.
    reader: Mutex<File>,

    /// Current file size (end of the last complete batch).
    file_size: AtomicU64,

    /// Number of rows written since the last fsync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N rows.
    sync_interval: u64,

    #[cfg(test)]
    fail_next_sync: std::sync::atomic::AtomicBool,
}

impl FactLog {
    /// Default sync interval - sync every 100 rows.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a fact log, returning the rows of every complete batch.
    ///
    /// Anything after the last complete batch (a torn write or a corrupt tail)
    /// is truncated away.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<RecoveredRow>)> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let (rows, valid_end) = Self::recover(&file, file_len)?;
        if valid_end < file_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = file_len - valid_end,
                "truncating incomplete tail of fact log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let reader = File::open(&path)?;

        Ok((
            Self {
                path,
                writer: Mutex::new(file),
                reader: Mutex::new(reader),
                file_size: AtomicU64::new(valid_end),
                writes_since_sync: Mutex::new(0),
                sync_interval: sync_interval.max(1),
                #[cfg(test)]
                fail_next_sync: std::sync::atomic::AtomicBool::new(false),
            },
            rows,
        ))
    }

    /// Append one batch of already-serialled facts. Returns each row's offset.
    ///
    /// The batch counts as written only once its bytes (and the fsync, when
    /// one is due) succeed. On failure the file is cut back to where the batch
    /// started, so the batch's serials are free again.
    pub fn append_batch(&self, rows: &[(Serial, &Fact)]) -> Result<Vec<u64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut file = self.writer.lock();
        let start = self.file_size.load(Ordering::Acquire);

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(rows.len());
        for (i, (serial, fact)) in rows.iter().enumerate() {
            offsets.push(start + buf.len() as u64);
            let flags = if i + 1 == rows.len() { FLAG_BATCH_END } else { 0 };
            encode_row(&mut buf, *serial, fact, flags)?;
        }

        let mut writes = self.writes_since_sync.lock();
        let sync_due = *writes + rows.len() as u64 >= self.sync_interval;

        if let Err(e) = self.write_batch(&mut file, start, &buf, sync_due) {
            if let Err(undo) = file.set_len(start) {
                tracing::error!(error = %undo, offset = start, "cannot truncate failed batch");
            }
            tracing::warn!(error = %e, offset = start, rows = rows.len(), "fact batch not written");
            return Err(e);
        }

        self.file_size
            .store(start + buf.len() as u64, Ordering::Release);
        *writes = if sync_due { 0 } else { *writes + rows.len() as u64 };

        Ok(offsets)
    }

    fn write_batch(&self, file: &mut File, start: u64, buf: &[u8], sync: bool) -> Result<()> {
        file.seek(SeekFrom::Start(start))?;
        file.write_all(buf)?;
        if sync {
            #[cfg(test)]
            {
                if self.fail_next_sync.swap(false, Ordering::SeqCst) {
                    let injected = std::io::Error::new(std::io::ErrorKind::Other, "injected fsync failure");
                    return Err(injected.into());
                }
            }
            file.sync_data()?;
        }
        Ok(())
    }

    /// Make the next due fsync fail.
    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::SeqCst);
    }

    /// Read the fact stored at `offset`, with its serial stamped.
    pub fn read_at(&self, offset: u64) -> Result<Fact> {
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let row = decode_row(&mut *file)?;
        Ok(row.into_fact())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.writer.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan the file from the start, keeping only complete batches.
    fn recover(file: &File, file_len: u64) -> Result<(Vec<RecoveredRow>, u64)> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut committed = Vec::new();
        let mut pending = Vec::new();
        let mut offset = 0u64;
        let mut valid_end = 0u64;

        while offset < file_len {
            let row = match decode_row(&mut reader) {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "stopping fact log recovery at unreadable row");
                    break;
                }
            };
            let row_len = row.encoded_len;
            let batch_end = row.flags & FLAG_BATCH_END != 0;
            let mut header = row.header;
            header.serial = Some(row.serial);
            pending.push(RecoveredRow { offset, header });
            offset += row_len;

            if batch_end {
                committed.append(&mut pending);
                valid_end = offset;
            }
        }

        Ok((committed, valid_end))
    }
}

/// A decoded row.
struct Row {
    flags: u8,
    serial: Serial,
    header: FactHeader,
    payload: serde_json::Value,
    encoded_len: u64,
}

impl Row {
    fn into_fact(self) -> Fact {
        let mut header = self.header;
        header.serial = Some(self.serial);
        Fact {
            header,
            payload: self.payload,
        }
    }
}

/// Layout: magic, version, flags, serial, header (msgpack), payload (json), crc32.
fn encode_row(buf: &mut Vec<u8>, serial: Serial, fact: &Fact, flags: u8) -> Result<()> {
    let mut header = fact.header.clone();
    header.serial = None;
    let header_bytes = rmp_serde::to_vec_named(&header)?;
    let payload_bytes = serde_json::to_vec(&fact.payload)?;

    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| StoreError::Serialization("fact header too large".into()))?;
    let payload_len = u32::try_from(payload_bytes.len())
        .map_err(|_| StoreError::Serialization("fact payload too large".into()))?;

    buf.extend_from_slice(ROW_MAGIC);
    buf.push(ROW_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&serial.0.to_le_bytes());
    buf.extend_from_slice(&header_len.to_le_bytes());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&payload_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    hasher.update(&payload_bytes);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(())
}

fn decode_row(reader: &mut impl Read) -> Result<Row> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != ROW_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid fact row magic".into()));
    }

    let mut version_flags = [0u8; 2];
    reader.read_exact(&mut version_flags)?;
    if version_flags[0] != ROW_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported fact row version: {}",
            version_flags[0]
        )));
    }
    let flags = version_flags[1];

    let mut serial_bytes = [0u8; 8];
    reader.read_exact(&mut serial_bytes)?;
    let serial = Serial(u64::from_le_bytes(serial_bytes));

    let header_bytes = read_block(reader)?;
    let payload_bytes = read_block(reader)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    hasher.update(&payload_bytes);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let header: FactHeader = rmp_serde::from_slice(&header_bytes)?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| StoreError::Corruption {
            serial,
            reason: e.to_string(),
        })?;

    let encoded_len = (4 + 2 + 8 + 4 + header_bytes.len() + 4 + payload_bytes.len() + 4) as u64;

    Ok(Row {
        flags,
        serial,
        header,
        payload,
        encoded_len,
    })
}

fn read_block(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let (log, rows) = FactLog::open(dir.path().join("facts.log"), 1).unwrap();
        assert!(rows.is_empty());

        let fact = Fact::new("ns", json!({"n": 1})).with_type("T");
        let offsets = log.append_batch(&[(Serial(1), &fact)]).unwrap();
        assert_eq!(offsets, vec![0]);

        let read = log.read_at(0).unwrap();
        assert_eq!(read.id(), fact.id());
        assert_eq!(read.serial(), Some(Serial(1)));
        assert_eq!(read.payload, json!({"n": 1}));
    }

    #[test]
    fn test_reopen_recovers_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facts.log");

        let facts: Vec<Fact> = (0..5).map(|i| Fact::new("ns", json!({ "i": i }))).collect();
        {
            let (log, _) = FactLog::open(&path, 100).unwrap();
            let batch: Vec<_> = facts
                .iter()
                .enumerate()
                .map(|(i, f)| (Serial(i as u64 + 1), f))
                .collect();
            log.append_batch(&batch[..2]).unwrap();
            log.append_batch(&batch[2..]).unwrap();
            log.sync().unwrap();
        }

        let (_log, rows) = FactLog::open(&path, 100).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4].header.serial, Some(Serial(5)));
        assert_eq!(rows[4].header.id, facts[4].id());
    }

    #[test]
    fn test_failed_sync_truncates_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facts.log");
        let (log, _) = FactLog::open(&path, 1).unwrap();

        let first = Fact::new("ns", json!(1));
        log.append_batch(&[(Serial(1), &first)]).unwrap();
        let size = log.size();

        log.fail_next_sync();
        let lost = Fact::new("ns", json!(2));
        assert!(log.append_batch(&[(Serial(2), &lost)]).is_err());
        assert_eq!(log.size(), size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        let retry = Fact::new("ns", json!(3));
        let offsets = log.append_batch(&[(Serial(2), &retry)]).unwrap();
        assert_eq!(offsets, vec![size]);
        drop(log);

        let (_log, rows) = FactLog::open(&path, 1).unwrap();
        let ids: Vec<_> = rows.iter().map(|row| row.header.id).collect();
        assert_eq!(ids, vec![first.id(), retry.id()]);
    }

    #[test]
    fn test_torn_batch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facts.log");

        let first = Fact::new("ns", json!(1));
        let second = Fact::new("ns", json!(2));
        let good_len = {
            let (log, _) = FactLog::open(&path, 1).unwrap();
            log.append_batch(&[(Serial(1), &first)]).unwrap();
            let len = log.size();
            log.append_batch(&[(Serial(2), &second)]).unwrap();
            len
        };

        // Chop the second batch in half.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + (full_len - good_len) / 2).unwrap();
        drop(file);

        let (log, rows) = FactLog::open(&path, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(log.size(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }
}
