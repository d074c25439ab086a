//! Append-only token table file.
//!
//! Every insert and delete of a token row is appended as a record. Opening
//! the file replays the records; a torn or corrupt tail is dropped. The file
//! is rewritten with only live rows after a purge and whenever replay saw
//! deleted or torn records.

use super::TokenRow;
use crate::error::{Result, StoreError};
use crate::tokens::StateToken;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic bytes for token records.
const RECORD_MAGIC: &[u8; 4] = b"TOK\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

const KIND_INSERT: u8 = 1;
const KIND_DELETE: u8 = 2;

struct Writer {
    file: File,
    /// End of the last complete record.
    size: u64,
}

/// Persisted token table.
pub struct TokenLog {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl TokenLog {
    /// Open or create the token file, returning the live rows.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, HashMap<StateToken, TokenRow>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let (tokens, records, valid_end) = replay(&file, file_len)?;
        let log = Self {
            path,
            writer: Mutex::new(Writer {
                file,
                size: valid_end,
            }),
        };

        if valid_end < file_len {
            tracing::warn!(
                path = %log.path.display(),
                discarded_bytes = file_len - valid_end,
                "dropping incomplete tail of token table"
            );
        }
        if valid_end < file_len || records > tokens.len() {
            log.rewrite(&tokens)?;
        }
        tracing::debug!(tokens = tokens.len(), records, "token table opened");

        Ok((log, tokens))
    }

    pub fn insert(&self, token: &StateToken, row: &TokenRow) -> Result<()> {
        let mut buf = Vec::new();
        encode_record(&mut buf, KIND_INSERT, token, row)?;
        self.append(&buf)
    }

    pub fn delete(&self, token: &StateToken) -> Result<()> {
        let mut buf = Vec::new();
        let tombstone = TokenRow {
            created: Timestamp::now(),
            snapshot: Vec::new(),
        };
        encode_record(&mut buf, KIND_DELETE, token, &tombstone)?;
        self.append(&buf)
    }

    /// Replace the file with one insert record per live row.
    pub fn rewrite(&self, live: &HashMap<StateToken, TokenRow>) -> Result<()> {
        let mut buf = Vec::new();
        for (token, row) in live {
            encode_record(&mut buf, KIND_INSERT, token, row)?;
        }

        let mut writer = self.writer.lock();
        let tmp = self.path.with_extension("compact");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *writer = Writer {
            file,
            size: buf.len() as u64,
        };
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.lock().file.sync_data()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    fn append(&self, buf: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let start = writer.size;

        let written = writer
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| writer.file.write_all(buf));
        if let Err(e) = written {
            if let Err(undo) = writer.file.set_len(start) {
                tracing::error!(error = %undo, offset = start, "cannot truncate failed token record");
            }
            return Err(e.into());
        }

        writer.size = start + buf.len() as u64;
        Ok(())
    }
}

/// Replay records, returning live rows, the record count and the end of the
/// last readable record.
fn replay(file: &File, file_len: u64) -> Result<(HashMap<StateToken, TokenRow>, usize, u64)> {
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);

    let mut tokens = HashMap::new();
    let mut records = 0;
    let mut offset = 0u64;

    while offset < file_len {
        let (kind, token, row, len) = match decode_record(&mut reader) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(offset, error = %e, "stopping token table replay at unreadable record");
                break;
            }
        };
        match kind {
            KIND_INSERT => {
                tokens.insert(token, row);
            }
            _ => {
                tokens.remove(&token);
            }
        }
        records += 1;
        offset += len;
    }

    Ok((tokens, records, offset))
}

/// Layout: magic, version, kind, token (16 bytes), created (i64), snapshot
/// length + bytes, crc32 of everything after the version byte.
fn encode_record(buf: &mut Vec<u8>, kind: u8, token: &StateToken, row: &TokenRow) -> Result<()> {
    let snapshot_len = u32::try_from(row.snapshot.len())
        .map_err(|_| StoreError::Serialization("token snapshot too large".into()))?;

    let body_start = buf.len() + RECORD_MAGIC.len() + 1;
    buf.extend_from_slice(RECORD_MAGIC);
    buf.push(RECORD_VERSION);
    buf.push(kind);
    buf.extend_from_slice(token.0.as_bytes());
    buf.extend_from_slice(&row.created.0.to_le_bytes());
    buf.extend_from_slice(&snapshot_len.to_le_bytes());
    buf.extend_from_slice(&row.snapshot);

    let checksum = crc32fast::hash(&buf[body_start..]);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(())
}

fn decode_record(reader: &mut impl Read) -> Result<(u8, StateToken, TokenRow, u64)> {
    let mut head = [0u8; 4 + 1 + 1 + 16 + 8 + 4];
    reader.read_exact(&mut head)?;
    if &head[..4] != RECORD_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid token record magic".into()));
    }
    if head[4] != RECORD_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported token record version: {}",
            head[4]
        )));
    }
    let kind = head[5];
    if kind != KIND_INSERT && kind != KIND_DELETE {
        return Err(StoreError::InvalidFormat(format!("Unknown token record kind: {}", kind)));
    }

    let mut token_bytes = [0u8; 16];
    token_bytes.copy_from_slice(&head[6..22]);
    let mut created_bytes = [0u8; 8];
    created_bytes.copy_from_slice(&head[22..30]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&head[30..34]);

    let mut snapshot = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut snapshot)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&head[5..]);
    hasher.update(&snapshot);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let len = (head.len() + snapshot.len() + 4) as u64;
    let row = TokenRow {
        created: Timestamp(i64::from_le_bytes(created_bytes)),
        snapshot,
    };
    Ok((kind, StateToken(Uuid::from_bytes(token_bytes)), row, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(created: i64, snapshot: &[u8]) -> TokenRow {
        TokenRow {
            created: Timestamp(created),
            snapshot: snapshot.to_vec(),
        }
    }

    #[test]
    fn test_replay_applies_inserts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.log");
        let (a, b) = (StateToken::new(), StateToken::new());
        {
            let (log, tokens) = TokenLog::open(&path).unwrap();
            assert!(tokens.is_empty());
            log.insert(&a, &row(1, b"snap-a")).unwrap();
            log.insert(&b, &row(2, b"snap-b")).unwrap();
            log.delete(&a).unwrap();
        }

        let (log, tokens) = TokenLog::open(&path).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[&b].snapshot, b"snap-b".to_vec());
        assert_eq!(tokens[&b].created, Timestamp(2));
        // The delete was compacted away on open.
        let mut expected = Vec::new();
        encode_record(&mut expected, KIND_INSERT, &b, &row(2, b"snap-b")).unwrap();
        assert_eq!(log.size(), expected.len() as u64);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.log");
        let token = StateToken::new();
        {
            let (log, _) = TokenLog::open(&path).unwrap();
            log.insert(&token, &row(5, b"x")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"TOK\0\x01\x01half").unwrap();
        drop(file);

        let (log, tokens) = TokenLog::open(&path).unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains_key(&token));

        let other = StateToken::new();
        log.insert(&other, &row(6, b"y")).unwrap();
        drop(log);
        let (_, tokens) = TokenLog::open(&path).unwrap();
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.log");
        let (first, second) = (StateToken::new(), StateToken::new());
        {
            let (log, _) = TokenLog::open(&path).unwrap();
            log.insert(&first, &row(1, b"aaaa")).unwrap();
            log.insert(&second, &row(2, b"bbbb")).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let (_, tokens) = TokenLog::open(&path).unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains_key(&first));
    }
}
