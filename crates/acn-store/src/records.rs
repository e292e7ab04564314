//! Append-only file of agent records.

use acn_types::AgentRecord;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest record accepted on append or replay.
const MAX_RECORD_SIZE: u32 = 1024 * 1024;

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only store of [`AgentRecord`]s backed by a single file.
///
/// Appends and replays take the same lock, so a replay never observes a
/// half-written record from this process.
#[derive(Clone)]
pub struct RecordStore {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RecordStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let store = Self {
            path,
            file: Arc::new(Mutex::new(file)),
        };
        let records = store.load()?;
        debug!(
            path = %store.path.display(),
            records = records.len(),
            "Opened agent record store"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk.
    pub fn append(&self, record: &AgentRecord) -> StoreResult<()> {
        let body = serde_json::to_vec(record)?;
        if body.len() > MAX_RECORD_SIZE as usize {
            return Err(StoreError::RecordTooLarge {
                size: body.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&frame)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Every stored record, in append order.
    ///
    /// A torn tail left by an interrupted append is cut off here, so the
    /// next append starts on a record boundary.
    pub fn load(&self) -> StoreResult<Vec<AgentRecord>> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(0))?;
        let (records, valid_len) = read_frames(BufReader::new(&mut *file))?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %self.path.display(),
                valid_len,
                dropped = file_len - valid_len,
                "Truncating torn record at end of store"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        // Appends always go to the end regardless of the cursor.
        file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    /// Fold the log into the latest record per address.
    pub fn replay(&self) -> StoreResult<HashMap<String, AgentRecord>> {
        let mut latest = HashMap::new();
        for record in self.load()? {
            latest.insert(record.address.clone(), record);
        }
        Ok(latest)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Decode a sequence of length-prefixed records.
///
/// A truncated final frame (an interrupted append) ends the sequence with a
/// warning; a complete frame that does not decode is an error.
pub fn read_records<R: Read>(reader: R) -> StoreResult<Vec<AgentRecord>> {
    read_frames(reader).map(|(records, _)| records)
}

/// Decode records and report the byte length of the complete frames.
fn read_frames<R: Read>(mut reader: R) -> StoreResult<(Vec<AgentRecord>, u64)> {
    let mut records = Vec::new();
    let mut offset: u64 = 0;
    loop {
        let mut header = [0u8; 4];
        match read_full(&mut reader, &mut header)? {
            0 => break,
            n if n < header.len() => {
                warn!(offset, "Record store ends with a truncated header, ignoring tail");
                break;
            }
            _ => {}
        }
        let len = u32::from_be_bytes(header);
        if len > MAX_RECORD_SIZE {
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("record length {len} exceeds {MAX_RECORD_SIZE}"),
            });
        }
        let mut body = vec![0u8; len as usize];
        if read_full(&mut reader, &mut body)? < body.len() {
            warn!(offset, "Record store ends with a truncated record, ignoring tail");
            break;
        }
        let record: AgentRecord =
            serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
                offset,
                reason: e.to_string(),
            })?;
        records.push(record);
        offset += 4 + len as u64;
    }
    Ok((records, offset))
}

/// Fill `buf` as far as the reader allows, returning the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(address: &str, peer_public_key: &str) -> AgentRecord {
        AgentRecord {
            address: address.to_string(),
            public_key: "02aa".to_string(),
            ledger_id: "fetchai".to_string(),
            peer_public_key: peer_public_key.to_string(),
            signature: "c2ln".to_string(),
        }
    }

    fn setup() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("agent_records_store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_empty_store() {
        let (_dir, store) = setup();
        assert!(store.load().unwrap().is_empty());
        assert!(store.replay().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_load_in_order() {
        let (_dir, store) = setup();
        store.append(&make_record("fetch1a", "03aa")).unwrap();
        store.append(&make_record("fetch1b", "03bb")).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, "fetch1a");
        assert_eq!(records[1].address, "fetch1b");
    }

    #[test]
    fn test_replay_last_write_wins() {
        let (_dir, store) = setup();
        store.append(&make_record("fetch1a", "03aa")).unwrap();
        store.append(&make_record("fetch1b", "03bb")).unwrap();
        store.append(&make_record("fetch1a", "03cc")).unwrap();

        let latest = store.replay().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["fetch1a"].peer_public_key, "03cc");
        assert_eq!(store.load().unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store");
        {
            let store = RecordStore::open(&path).unwrap();
            store.append(&make_record("fetch1a", "03aa")).unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        store.append(&make_record("fetch1b", "03bb")).unwrap();
        let addrs: Vec<String> = store.load().unwrap().into_iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec!["fetch1a", "fetch1b"]);
    }

    #[test]
    fn test_load_then_append_goes_to_end() {
        let (_dir, store) = setup();
        store.append(&make_record("fetch1a", "03aa")).unwrap();
        store.load().unwrap();
        store.append(&make_record("fetch1b", "03bb")).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let (_dir, store) = setup();
        store.append(&make_record("fetch1a", "03aa")).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(b"{\"addr").unwrap();
        }
        let records = store.load().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_append_after_torn_tail_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = RecordStore::open(&path).unwrap();
            store.append(&make_record("fetch1a", "03aa")).unwrap();
        }
        let intact_len = std::fs::metadata(&path).unwrap().len();
        {
            // Crash in the middle of an append.
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(b"{\"addr").unwrap();
        }
        {
            let store = RecordStore::open(&path).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);
            assert_eq!(store.replay().unwrap().len(), 1);
            store.append(&make_record("fetch1b", "03bb")).unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        let addrs: Vec<String> = store.load().unwrap().into_iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec!["fetch1a", "fetch1b"]);
    }

    #[test]
    fn test_torn_header_is_cut_on_load() {
        let (_dir, store) = setup();
        store.append(&make_record("fetch1a", "03aa")).unwrap();
        let intact_len = std::fs::metadata(store.path()).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
            file.write_all(&[0, 0]).unwrap();
        }
        assert_eq!(store.load().unwrap().len(), 1);
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), intact_len);
        store.append(&make_record("fetch1b", "03bb")).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"{x}");
        let err = read_records(&bytes[..]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset: 0, .. }));
    }
}
