//! Append-only storage of serialized nodes.
//!
//! Node records are appended to numbered data files `nodes.<n>` in the tree
//! directory; a new file is started once the current one would grow past
//! the configured size. Rewriting a node appends a new record and moves its
//! location. The location table is saved to `nodes.idx` on sync.
//!
//! Record layout: `id: u64 | len: u32 | payload | crc32: u32`, little-endian,
//! with the checksum covering everything before it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use trellis_common::encoding::{read_u32_le, read_u64_le};
use trellis_common::{NodeId, Result, TrellisError};

/// Bytes of a record that are not payload.
const RECORD_HEADER: usize = 12;
const RECORD_OVERHEAD: usize = RECORD_HEADER + 4;

const INDEX_FILE: &str = "nodes.idx";
const INDEX_ENTRY: usize = 24;

/// Length of the record framing a payload of `payload_len` bytes. Record
/// lengths must fit the u32 length fields of the record and the index.
fn record_len(payload_len: usize) -> Result<u32> {
    payload_len
        .checked_add(RECORD_OVERHEAD)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or(TrellisError::CapacityExceeded {
            offset: payload_len,
            max: u32::MAX as usize - RECORD_OVERHEAD,
        })
}

/// Where the latest record of a node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeLocation {
    file: u32,
    offset: u64,
    /// Whole record length, overhead included.
    len: u32,
}

/// Reads and writes node records.
pub(crate) struct NodeStore {
    dir: PathBuf,
    file_max_size: u64,
    read_only: bool,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    /// Open data files keyed by file number.
    files: HashMap<u32, File>,
    /// File receiving new records.
    current_file: u32,
    current_len: u64,
    locations: HashMap<NodeId, NodeLocation>,
    /// Locations changed since the index was last saved.
    index_dirty: bool,
}

impl StoreInner {
    fn file(&mut self, dir: &Path, file_no: u32, read_only: bool) -> Result<&mut File> {
        if !self.files.contains_key(&file_no) {
            let path = data_file_path(dir, file_no);
            let file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .create(!read_only)
                .open(path)?;
            self.files.insert(file_no, file);
        }
        self.files
            .get_mut(&file_no)
            .ok_or_else(|| TrellisError::StoreCorrupted(format!("data file {file_no} not open")))
    }
}

fn data_file_path(dir: &Path, file_no: u32) -> PathBuf {
    dir.join(format!("nodes.{file_no}"))
}

impl NodeStore {
    /// Opens the store in `dir`, loading the location index if present.
    pub(crate) fn open(dir: &Path, file_max_size: u64, read_only: bool) -> Result<Self> {
        if !read_only {
            fs::create_dir_all(dir)?;
        }

        let index_path = dir.join(INDEX_FILE);
        let locations = if index_path.exists() {
            load_index(&fs::read(&index_path)?)?
        } else {
            HashMap::new()
        };

        let current_file = locations.values().map(|loc| loc.file).max().unwrap_or(0);
        let current_len = match fs::metadata(data_file_path(dir, current_file)) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        debug!(
            dir = %dir.display(),
            nodes = locations.len(),
            current_file,
            "node store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            file_max_size,
            read_only,
            inner: Mutex::new(StoreInner {
                files: HashMap::new(),
                current_file,
                current_len,
                locations,
                index_dirty: false,
            }),
        })
    }

    /// Appends a record for node `id`, replacing its previous location.
    pub(crate) fn write(&self, id: NodeId, payload: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TrellisError::ReadOnly);
        }
        let record_len = record_len(payload.len())?;
        let payload_len = record_len - RECORD_OVERHEAD as u32;

        let mut record = Vec::with_capacity(payload.len() + RECORD_OVERHEAD);
        record.extend_from_slice(&id.to_le_bytes());
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.extend_from_slice(payload);
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        let mut inner = self.inner.lock();
        if inner.current_len > 0 && inner.current_len + record_len as u64 > self.file_max_size {
            inner.current_file += 1;
            inner.current_len = 0;
            info!(file = inner.current_file, "starting new node data file");
        }

        let file_no = inner.current_file;
        let offset = inner.current_len;
        {
            let file = inner.file(&self.dir, file_no, self.read_only)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&record)?;
        }

        inner.current_len += record_len as u64;
        inner.locations.insert(
            id,
            NodeLocation {
                file: file_no,
                offset,
                len: record_len,
            },
        );
        inner.index_dirty = true;
        Ok(())
    }

    /// Reads the latest payload of node `id`.
    pub(crate) fn read(&self, id: NodeId) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        let loc = inner
            .locations
            .get(&id)
            .copied()
            .ok_or(TrellisError::NodeNotFound(id))?;

        let mut record = vec![0u8; loc.len as usize];
        {
            let file = inner.file(&self.dir, loc.file, self.read_only)?;
            file.seek(SeekFrom::Start(loc.offset))?;
            if let Err(e) = file.read_exact(&mut record) {
                if e.kind() == ErrorKind::UnexpectedEof {
                    return Err(TrellisError::corrupted(id, "record truncated on disk"));
                }
                return Err(e.into());
            }
        }
        drop(inner);

        let body = record.len().checked_sub(4).filter(|len| *len >= RECORD_HEADER);
        let Some(body) = body else {
            return Err(TrellisError::corrupted(id, "record shorter than its header"));
        };
        let stored_id = read_u64_le(&record, 0);
        let payload_len = read_u32_le(&record, 8).map(|len| len as usize);
        let stored_crc = read_u32_le(&record, body);
        if stored_id != Some(id) {
            return Err(TrellisError::corrupted(id, "record belongs to another node"));
        }
        if payload_len != Some(body - RECORD_HEADER) {
            return Err(TrellisError::corrupted(id, "record length mismatch"));
        }
        if stored_crc != Some(crc32fast::hash(&record[..body])) {
            return Err(TrellisError::corrupted(id, "record checksum mismatch"));
        }

        Ok(Bytes::from(record).slice(RECORD_HEADER..body))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.inner.lock().locations.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().locations.len()
    }

    /// Number of the data file receiving new records.
    pub(crate) fn current_file(&self) -> u32 {
        self.inner.lock().current_file
    }

    /// Saves the location index and syncs every open data file.
    pub(crate) fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        for file in inner.files.values() {
            file.sync_all()?;
        }
        if inner.index_dirty {
            let encoded = encode_index(&inner.locations);
            let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
            {
                let mut file = File::create(&tmp)?;
                file.write_all(&encoded)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
            inner.index_dirty = false;
            debug!(nodes = inner.locations.len(), "node index saved");
        }
        Ok(())
    }
}

/// `count: u64`, then per node `id: u64 | file: u32 | offset: u64 | len: u32`,
/// then a crc32 of everything before it.
fn encode_index(locations: &HashMap<NodeId, NodeLocation>) -> Vec<u8> {
    let mut ids: Vec<_> = locations.keys().copied().collect();
    ids.sort_unstable();

    let mut buf = Vec::with_capacity(8 + ids.len() * INDEX_ENTRY + 4);
    buf.extend_from_slice(&(ids.len() as u64).to_le_bytes());
    for id in ids {
        let loc = locations[&id];
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&loc.file.to_le_bytes());
        buf.extend_from_slice(&loc.offset.to_le_bytes());
        buf.extend_from_slice(&loc.len.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn load_index(buf: &[u8]) -> Result<HashMap<NodeId, NodeLocation>> {
    let corrupted = |reason: &str| TrellisError::StoreCorrupted(format!("{INDEX_FILE}: {reason}"));

    let count = read_u64_le(buf, 0).ok_or_else(|| corrupted("missing entry count"))? as usize;
    let expected = count
        .checked_mul(INDEX_ENTRY)
        .and_then(|len| len.checked_add(12))
        .ok_or_else(|| corrupted("entry count out of range"))?;
    if buf.len() != expected {
        return Err(corrupted(&format!("expected {expected} bytes, found {}", buf.len())));
    }
    let body = buf.len() - 4;
    if read_u32_le(buf, body) != Some(crc32fast::hash(&buf[..body])) {
        return Err(corrupted("checksum mismatch"));
    }

    let mut locations = HashMap::with_capacity(count);
    for i in 0..count {
        let at = 8 + i * INDEX_ENTRY;
        let entry = (
            read_u64_le(buf, at),
            read_u32_le(buf, at + 8),
            read_u64_le(buf, at + 12),
            read_u32_le(buf, at + 20),
        );
        let (Some(id), Some(file), Some(offset), Some(len)) = entry else {
            return Err(corrupted("truncated entry"));
        };
        locations.insert(id, NodeLocation { file, offset, len });
    }
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_write_read() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();

        store.write(1, b"first node").unwrap();
        store.write(2, b"second").unwrap();
        assert_eq!(&store.read(1).unwrap()[..], b"first node");
        assert_eq!(&store.read(2).unwrap()[..], b"second");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_record_len_limits() {
        assert_eq!(record_len(0).unwrap(), RECORD_OVERHEAD as u32);
        assert_eq!(record_len(10).unwrap(), 10 + RECORD_OVERHEAD as u32);

        let largest = u32::MAX as usize - RECORD_OVERHEAD;
        assert_eq!(record_len(largest).unwrap(), u32::MAX);
        assert!(matches!(
            record_len(largest + 1),
            Err(TrellisError::CapacityExceeded { offset, .. }) if offset == largest + 1
        ));
        assert!(record_len(usize::MAX).is_err());
    }

    #[test]
    fn test_store_rewrite_moves_location() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();

        store.write(7, b"old").unwrap();
        store.write(7, b"newer payload").unwrap();
        assert_eq!(&store.read(7).unwrap()[..], b"newer payload");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_missing_node() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();
        assert!(!store.contains(3));
        assert!(matches!(store.read(3), Err(TrellisError::NodeNotFound(3))));
    }

    #[test]
    fn test_store_rotates_files() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path(), 64, false).unwrap();

        for id in 0..4u64 {
            store.write(id, &[id as u8; 40]).unwrap();
        }
        assert_eq!(store.current_file(), 3);
        assert!(dir.path().join("nodes.0").exists());
        assert!(dir.path().join("nodes.3").exists());
        for id in 0..4u64 {
            assert_eq!(&store.read(id).unwrap()[..], &[id as u8; 40]);
        }
    }

    #[test]
    fn test_store_persists_index() {
        let dir = tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();
            store.write(11, b"persisted").unwrap();
            store.sync().unwrap();
        }

        let store = NodeStore::open(dir.path(), 1 << 20, true).unwrap();
        assert_eq!(&store.read(11).unwrap()[..], b"persisted");
        assert!(matches!(store.write(12, b"x"), Err(TrellisError::ReadOnly)));
    }

    #[test]
    fn test_store_detects_flipped_byte() {
        let dir = tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();
            store.write(5, b"checksummed payload").unwrap();
            store.sync().unwrap();
        }

        let path = dir.path().join("nodes.0");
        let mut raw = fs::read(&path).unwrap();
        raw[RECORD_HEADER + 3] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();
        assert!(matches!(
            store.read(5),
            Err(TrellisError::Corrupted { node_id: 5, .. })
        ));
    }

    #[test]
    fn test_store_rejects_damaged_index() {
        let dir = tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path(), 1 << 20, false).unwrap();
            store.write(5, b"payload").unwrap();
            store.sync().unwrap();
        }
        let path = dir.path().join(INDEX_FILE);
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 1);
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            NodeStore::open(dir.path(), 1 << 20, false),
            Err(TrellisError::StoreCorrupted(_))
        ));
    }
}
