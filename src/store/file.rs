//! On-disk MessageStore backend: a sequence of fixed-maximum block files
//! holding length-prefixed records, with a crash-recoverable in-memory
//! index rebuilt by scanning on open, tombstone deletes, and threshold
//! compaction (spec.md §4.1).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

use super::{MessageStore, StoreState};
use crate::error::{err, Result};
use crate::message::{Headers, Message};

/// Blocks roll over once they would exceed this size, keeping any single
/// recovery scan bounded.
const MAX_BLOCK_BYTES: u64 = 16 * 1024 * 1024;
/// Compact once at least this many tombstones have accumulated and they
/// make up more than half the live+deleted record count.
const COMPACT_MIN_TOMBSTONES: u64 = 16;

const KIND_MESSAGE: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;

#[derive(Clone)]
struct IndexEntry {
    block: u64,
    offset: u64,
    len: u64,
    deleted: bool,
    timestamp: DateTime<Utc>,
}

struct FileInner {
    index: BTreeMap<u64, IndexEntry>,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
    num_deleted: u64,
    active_block: u64,
    active_file: File,
    active_size: u64,
}

/// Crash-safe, append-only message store backed by block files under
/// `root`.
pub struct FileStore {
    root: PathBuf,
    inner: RwLock<FileInner>,
}

fn block_path(root: &Path, block: u64) -> PathBuf {
    root.join(format!("blk_{:020}.log", block))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

fn encode_record(kind: u8, seq: u64, ts_millis: i64, subject: &str, headers_json: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 8 + 2 + subject.len() + 4 + headers_json.len() + 4 + payload.len() + 8);
    buf.push(kind);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&ts_millis.to_le_bytes());
    buf.extend_from_slice(&(subject.len() as u16).to_le_bytes());
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(&(headers_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(headers_json);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let checksum = fnv1a(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

struct DecodedRecord {
    kind: u8,
    seq: u64,
    timestamp: DateTime<Utc>,
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    total_len: u64,
}

/// Parses one record starting at the current read position of `data`.
/// Returns `None` (rather than erroring) on truncated/corrupt trailing
/// bytes, so a half-written record at the tail of the active block is
/// silently dropped on restart rather than failing the whole store.
fn decode_record(data: &[u8]) -> Option<DecodedRecord> {
    let mut off = 0usize;
    let need = |off: usize, n: usize| off + n <= data.len();
    if !need(off, 1) {
        return None;
    }
    let kind = data[off];
    off += 1;
    if !need(off, 8) {
        return None;
    }
    let seq = u64::from_le_bytes(data[off..off + 8].try_into().ok()?);
    off += 8;
    if !need(off, 8) {
        return None;
    }
    let ts_millis = i64::from_le_bytes(data[off..off + 8].try_into().ok()?);
    off += 8;
    if !need(off, 2) {
        return None;
    }
    let subject_len = u16::from_le_bytes(data[off..off + 2].try_into().ok()?) as usize;
    off += 2;
    if !need(off, subject_len) {
        return None;
    }
    let subject = std::str::from_utf8(&data[off..off + subject_len]).ok()?.to_string();
    off += subject_len;
    if !need(off, 4) {
        return None;
    }
    let hdr_len = u32::from_le_bytes(data[off..off + 4].try_into().ok()?) as usize;
    off += 4;
    if !need(off, hdr_len) {
        return None;
    }
    let headers: Headers = if hdr_len == 0 {
        Headers::new()
    } else {
        serde_json::from_slice(&data[off..off + hdr_len]).ok()?
    };
    off += hdr_len;
    if !need(off, 4) {
        return None;
    }
    let data_len = u32::from_le_bytes(data[off..off + 4].try_into().ok()?) as usize;
    off += 4;
    if !need(off, data_len) {
        return None;
    }
    let payload = data[off..off + data_len].to_vec();
    off += data_len;
    if !need(off, 8) {
        return None;
    }
    let checksum = u64::from_le_bytes(data[off..off + 8].try_into().ok()?);
    let expected = fnv1a(&data[0..off]);
    if checksum != expected {
        return None;
    }
    off += 8;
    let timestamp = Utc.timestamp_millis_opt(ts_millis).single()?;
    Some(DecodedRecord {
        kind,
        seq,
        timestamp,
        subject,
        headers,
        payload,
        total_len: off as u64,
    })
}

impl FileStore {
    /// Opens (creating if necessary) a FileStore rooted at `root`,
    /// rebuilding its index by scanning every block file in order.
    /// Corrupted trailing bytes mark the store recovered up to that
    /// point; earlier corrupted records are skipped rather than failing
    /// the whole restore (spec.md §4.1 failure semantics).
    pub fn open(root: impl Into<PathBuf>) -> Result<FileStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut block_ids: Vec<u64> = fs::read_dir(&root)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                let stripped = name.strip_prefix("blk_")?.strip_suffix(".log")?;
                stripped.parse::<u64>().ok()
            })
            .collect();
        block_ids.sort_unstable();

        let mut index = BTreeMap::new();
        let mut first_seq = 1u64;
        let mut last_seq = 0u64;
        let mut bytes = 0u64;
        let mut num_deleted = 0u64;

        for &block in &block_ids {
            let path = block_path(&root, block);
            let mut f = File::open(&path)?;
            let mut data = Vec::new();
            f.read_to_end(&mut data)?;
            let mut off = 0usize;
            while off < data.len() {
                let rec = match decode_record(&data[off..]) {
                    Some(r) => r,
                    None => break, // truncated/corrupt tail; stop scanning this block
                };
                let entry_offset = off as u64;
                off += rec.total_len as usize;
                match rec.kind {
                    KIND_MESSAGE => {
                        let acc = rec.payload.len() as u64 + rec.headers.encoded_len() as u64;
                        index.insert(
                            rec.seq,
                            IndexEntry {
                                block,
                                offset: entry_offset,
                                len: rec.total_len,
                                deleted: false,
                                timestamp: rec.timestamp,
                            },
                        );
                        bytes += acc;
                        last_seq = last_seq.max(rec.seq);
                    }
                    KIND_TOMBSTONE => {
                        if let Some(entry) = index.get_mut(&rec.seq) {
                            if !entry.deleted {
                                entry.deleted = true;
                                num_deleted += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // Tombstones later in the log may have marked earlier messages
        // deleted; re-derive live byte accounting by reading live
        // records back rather than trusting the running total above.
        let mut precise_bytes = 0u64;
        for (_, e) in index.iter().filter(|(_, e)| !e.deleted) {
            let path = block_path(&root, e.block);
            let mut f = File::open(&path)?;
            f.seek(SeekFrom::Start(e.offset))?;
            let mut buf = vec![0u8; e.len as usize];
            f.read_exact(&mut buf)?;
            if let Some(rec) = decode_record(&buf) {
                precise_bytes += rec.payload.len() as u64 + rec.headers.encoded_len() as u64;
            }
        }
        bytes = precise_bytes;

        first_seq = index
            .iter()
            .find(|(_, e)| !e.deleted)
            .map(|(seq, _)| *seq)
            .unwrap_or(last_seq + 1);

        let active_block = block_ids.last().copied().unwrap_or(0);
        let active_path = block_path(&root, active_block);
        let active_size = fs::metadata(&active_path).map(|m| m.len()).unwrap_or(0);
        let active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&active_path)?;

        Ok(FileStore {
            root,
            inner: RwLock::new(FileInner {
                index,
                first_seq,
                last_seq,
                bytes,
                num_deleted,
                active_block,
                active_file,
                active_size,
            }),
        })
    }

    fn read_record_at(&self, root: &Path, block: u64, offset: u64, len: u64) -> io::Result<DecodedRecord> {
        let path = block_path(root, block);
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)?;
        decode_record(&buf).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "corrupted block record"))
    }

    fn to_message(&self, seq: u64, rec: DecodedRecord) -> Message {
        Message {
            seq,
            subject: rec.subject,
            headers: rec.headers,
            payload: rec.payload,
            timestamp: rec.timestamp,
        }
    }

    fn maybe_compact(&self, inner: &mut FileInner) -> Result<()> {
        let total = inner.index.len() as u64;
        if inner.num_deleted < COMPACT_MIN_TOMBSTONES || total == 0 {
            return Ok(());
        }
        if (inner.num_deleted as f64) < (total as f64) * 0.5 {
            return Ok(());
        }
        self.compact(inner)
    }

    /// Rewrites every live record into a fresh block 0 and drops all
    /// other block files, clearing tombstone density back to zero.
    fn compact(&self, inner: &mut FileInner) -> Result<()> {
        let tmp_path = self.root.join("blk_compact.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut new_index = BTreeMap::new();
        let mut offset = 0u64;
        for (&seq, entry) in inner.index.iter().filter(|(_, e)| !e.deleted) {
            let rec = self.read_record_at(&self.root, entry.block, entry.offset, entry.len)?;
            let headers_json = serde_json::to_vec(&rec.headers)?;
            let buf = encode_record(KIND_MESSAGE, seq, rec.timestamp.timestamp_millis(), &rec.subject, &headers_json, &rec.payload);
            tmp.write_all(&buf)?;
            new_index.insert(
                seq,
                IndexEntry {
                    block: 0,
                    offset,
                    len: buf.len() as u64,
                    deleted: false,
                    timestamp: rec.timestamp,
                },
            );
            offset += buf.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with("blk_") && name.ends_with(".log") {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        let final_path = block_path(&self.root, 0);
        fs::rename(&tmp_path, &final_path)?;

        inner.active_file = OpenOptions::new().create(true).append(true).read(true).open(&final_path)?;
        inner.active_block = 0;
        inner.active_size = offset;
        inner.num_deleted = 0;
        inner.index = new_index;
        Ok(())
    }
}

impl MessageStore for FileStore {
    fn append(&self, subject: &str, headers: Headers, payload: Vec<u8>, timestamp: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let seq = inner.last_seq + 1;
        let headers_json = serde_json::to_vec(&headers)?;
        let buf = encode_record(KIND_MESSAGE, seq, timestamp.timestamp_millis(), subject, &headers_json, &payload);

        if inner.active_size + buf.len() as u64 > MAX_BLOCK_BYTES && inner.active_size > 0 {
            inner.active_block += 1;
            inner.active_size = 0;
            let path = block_path(&self.root, inner.active_block);
            inner.active_file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        }

        inner.active_file.write_all(&buf)?;
        inner.active_file.sync_all()?;

        let acc = payload.len() as u64 + headers.encoded_len() as u64;
        let entry = IndexEntry {
            block: inner.active_block,
            offset: inner.active_size,
            len: buf.len() as u64,
            deleted: false,
            timestamp,
        };
        inner.active_size += buf.len() as u64;
        inner.index.insert(seq, entry);
        inner.bytes += acc;
        inner.last_seq = seq;
        Ok(seq)
    }

    fn get(&self, seq: u64) -> Result<Message> {
        let inner = self.inner.read();
        let entry = inner
            .index
            .get(&seq)
            .filter(|e| !e.deleted)
            .cloned()
            .ok_or_else(|| err!(NotFound, "message {} not found", seq))?;
        drop(inner);
        let rec = self.read_record_at(&self.root, entry.block, entry.offset, entry.len)?;
        Ok(self.to_message(seq, rec))
    }

    fn delete_msg(&self, seq: u64) -> Result<bool> {
        let mut inner = self.inner.write();
        let acc = {
            let entry = inner
                .index
                .get(&seq)
                .ok_or_else(|| err!(NotFound, "message {} not found", seq))?;
            if entry.deleted {
                return Err(err!(NotFound, "message {} not found", seq));
            }
            let rec = self.read_record_at(&self.root, entry.block, entry.offset, entry.len)?;
            rec.payload.len() as u64 + rec.headers.encoded_len() as u64
        };

        let buf = encode_record(KIND_TOMBSTONE, seq, Utc::now().timestamp_millis(), "", &[], &[]);
        inner.active_file.write_all(&buf)?;
        inner.active_file.sync_all()?;
        inner.active_size += buf.len() as u64;

        if let Some(entry) = inner.index.get_mut(&seq) {
            entry.deleted = true;
        }
        inner.bytes = inner.bytes.saturating_sub(acc);
        inner.num_deleted += 1;

        if seq == inner.first_seq {
            inner.first_seq = inner
                .index
                .iter()
                .find(|(_, e)| !e.deleted)
                .map(|(s, _)| *s)
                .unwrap_or(inner.last_seq + 1);
        }

        self.maybe_compact(&mut inner)?;
        Ok(true)
    }

    fn purge(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        let removed = inner.index.values().filter(|e| !e.deleted).count() as u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with("blk_") && name.ends_with(".log") {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        let path = block_path(&self.root, 0);
        inner.active_file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        inner.active_block = 0;
        inner.active_size = 0;
        inner.index.clear();
        inner.bytes = 0;
        inner.num_deleted = 0;
        inner.first_seq = inner.last_seq + 1;
        Ok(removed)
    }

    fn first_seq(&self) -> u64 {
        self.inner.read().first_seq
    }

    fn last_seq(&self) -> u64 {
        self.inner.read().last_seq
    }

    fn state(&self) -> StoreState {
        let inner = self.inner.read();
        StoreState {
            msgs: inner.index.values().filter(|e| !e.deleted).count() as u64,
            bytes: inner.bytes,
            first_seq: inner.first_seq,
            last_seq: inner.last_seq,
            num_deleted: inner.num_deleted,
        }
    }

    fn scan_from(&self, seq: u64) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let entries: Vec<(u64, IndexEntry)> = inner
            .index
            .range(seq..)
            .filter(|(_, e)| !e.deleted)
            .map(|(s, e)| (*s, e.clone()))
            .collect();
        drop(inner);
        let mut out = Vec::with_capacity(entries.len());
        for (s, e) in entries {
            let rec = self.read_record_at(&self.root, e.block, e.offset, e.len)?;
            out.push(self.to_message(s, rec));
        }
        Ok(out)
    }

    fn scan_from_time(&self, t: DateTime<Utc>) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let entries: Vec<(u64, IndexEntry)> = inner
            .index
            .iter()
            .filter(|(_, e)| !e.deleted && e.timestamp >= t)
            .map(|(s, e)| (*s, e.clone()))
            .collect();
        drop(inner);
        let mut out = Vec::with_capacity(entries.len());
        for (s, e) in entries {
            let rec = self.read_record_at(&self.root, e.block, e.offset, e.len)?;
            out.push(self.to_message(s, rec));
        }
        Ok(out)
    }

    fn evict_to_limits(&self, max_msgs: i64, max_bytes: i64, max_age: i64, retain: &dyn Fn(u64) -> bool) -> Result<Vec<u64>> {
        let mut removed = Vec::new();
        loop {
            let (oldest, over) = {
                let inner = self.inner.read();
                let msgs = inner.index.values().filter(|e| !e.deleted).count() as i64;
                let bytes = inner.bytes as i64;
                let over_msgs = max_msgs >= 0 && msgs > max_msgs;
                let over_bytes = max_bytes >= 0 && bytes > max_bytes;
                let oldest = inner.index.iter().find(|(_, e)| !e.deleted).map(|(s, e)| (*s, e.timestamp));
                let over_age = if max_age >= 0 {
                    let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age);
                    oldest.map(|(_, ts)| ts < cutoff).unwrap_or(false)
                } else {
                    false
                };
                (oldest.map(|(s, _)| s), over_msgs || over_bytes || over_age)
            };
            if !over {
                break;
            }
            let oldest = match oldest {
                Some(s) => s,
                None => break,
            };
            if !retain(oldest) {
                break;
            }
            self.delete_msg(oldest)?;
            removed.push(oldest);
        }
        Ok(removed)
    }

    fn restore_messages(&self, messages: Vec<Message>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut first_inserted = inner.index.is_empty();
        for msg in messages {
            let headers_json = serde_json::to_vec(&msg.headers)?;
            let buf = encode_record(KIND_MESSAGE, msg.seq, msg.timestamp.timestamp_millis(), &msg.subject, &headers_json, &msg.payload);

            if inner.active_size + buf.len() as u64 > MAX_BLOCK_BYTES && inner.active_size > 0 {
                inner.active_block += 1;
                inner.active_size = 0;
                let path = block_path(&self.root, inner.active_block);
                inner.active_file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
            }
            inner.active_file.write_all(&buf)?;
            inner.active_file.sync_all()?;

            let acc = msg.payload.len() as u64 + msg.headers.encoded_len() as u64;
            inner.index.insert(
                msg.seq,
                IndexEntry {
                    block: inner.active_block,
                    offset: inner.active_size,
                    len: buf.len() as u64,
                    deleted: false,
                    timestamp: msg.timestamp,
                },
            );
            inner.active_size += buf.len() as u64;
            inner.bytes += acc;
            inner.first_seq = if first_inserted { msg.seq } else { inner.first_seq.min(msg.seq) };
            first_inserted = false;
            inner.last_seq = inner.last_seq.max(msg.seq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::tempdir;

    #[test]
    fn conforms() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        conformance::run(&store);
    }

    #[test]
    fn survives_restart() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.append("foo", Headers::new(), b"one".to_vec(), Utc::now()).unwrap();
            store.append("foo", Headers::new(), b"two".to_vec(), Utc::now()).unwrap();
            store.delete_msg(1).unwrap();
        }
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.last_seq(), 2);
        assert_eq!(reopened.first_seq(), 2);
        assert!(reopened.get(1).is_err());
        assert_eq!(reopened.get(2).unwrap().payload, b"two");
    }

    #[test]
    fn compacts_after_enough_tombstones() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for i in 0..40u8 {
            store.append("foo", Headers::new(), vec![i], Utc::now()).unwrap();
        }
        for seq in 1..=30u64 {
            store.delete_msg(seq).unwrap();
        }
        assert_eq!(store.state().num_deleted, 0, "compaction should have cleared tombstones");
        assert_eq!(store.state().msgs, 10);
    }
}
