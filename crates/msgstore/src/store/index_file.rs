//! On-disk hash index from message keys to commit log offsets.
//!
//! Layout: a 40-byte header, `slot_num` 4-byte slots each holding the newest entry index of
//! its bucket, then `index_num` 20-byte entries `[4B key hash][8B phy offset][4B time delta
//! (ms)][4B previous entry index]`. Entry index 0 is reserved as "empty".

use std::path::Path;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::message::string_hash_code;
use crate::storage::file::MappedFile;
use crate::storage::file::common::{read_i32_at, read_i64_at, read_u32_at, read_u64_at};

pub const INDEX_HEADER_SIZE: usize = 40;
pub const HASH_SLOT_SIZE: usize = 4;
pub const INDEX_ENTRY_SIZE: usize = 20;
pub const INVALID_INDEX: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
    pub begin_phy_offset: u64,
    pub end_phy_offset: u64,
    pub hash_slot_count: u32,
    /// Next entry index to allocate; starts at 1.
    pub index_count: u32,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            begin_timestamp: 0,
            end_timestamp: 0,
            begin_phy_offset: 0,
            end_phy_offset: 0,
            hash_slot_count: 0,
            index_count: 1,
        }
    }
}

impl IndexHeader {
    fn decode(buf: &[u8]) -> Self {
        Self {
            begin_timestamp: read_i64_at(buf, 0),
            end_timestamp: read_i64_at(buf, 8),
            begin_phy_offset: read_u64_at(buf, 16),
            end_phy_offset: read_u64_at(buf, 24),
            hash_slot_count: read_u32_at(buf, 32),
            index_count: read_u32_at(buf, 36).max(1),
        }
    }

    fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut out = [0u8; INDEX_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.begin_timestamp.to_be_bytes());
        out[8..16].copy_from_slice(&self.end_timestamp.to_be_bytes());
        out[16..24].copy_from_slice(&self.begin_phy_offset.to_be_bytes());
        out[24..32].copy_from_slice(&self.end_phy_offset.to_be_bytes());
        out[32..36].copy_from_slice(&self.hash_slot_count.to_be_bytes());
        out[36..40].copy_from_slice(&self.index_count.to_be_bytes());
        out
    }

    /// Number of real entries in the file.
    pub fn entry_count(&self) -> u32 {
        self.index_count - 1
    }
}

/// Non-negative 31-polynomial hash of an index key.
pub fn index_key_hash(key: &str) -> u32 {
    let hash = string_hash_code(key);
    if hash == i32::MIN { 0 } else { hash.unsigned_abs() }
}

pub fn index_file_size(slot_num: u32, index_num: u32) -> usize {
    INDEX_HEADER_SIZE + slot_num as usize * HASH_SLOT_SIZE + index_num as usize * INDEX_ENTRY_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutKeyOutcome {
    Stored,
    /// No room for another entry.
    Full,
    /// The time delta no longer fits the 4-byte field.
    TimeOverflow,
}

#[derive(Debug)]
pub struct IndexFile {
    mapped_file: MappedFile,
    slot_num: u32,
    index_num: u32,
    /// Guards every raw access to the mapping and mirrors the on-disk header.
    header: RwLock<IndexHeader>,
}

impl IndexFile {
    pub fn create(path: &Path, slot_num: u32, index_num: u32) -> Result<Self, StorageError> {
        let size = index_file_size(slot_num, index_num);
        let mapped_file = MappedFile::new(path, 0, size)?;
        let header = IndexHeader::default();
        // SAFETY: the file is not shared yet.
        unsafe { mapped_file.write_at(0, &header.encode()) };
        Ok(Self {
            mapped_file,
            slot_num,
            index_num,
            header: RwLock::new(header),
        })
    }

    pub fn open(path: &Path, slot_num: u32, index_num: u32) -> Result<Self, StorageError> {
        let size = index_file_size(slot_num, index_num);
        let actual = std::fs::metadata(path)
            .map_err(|e| StorageError::from_io_error(e, &format!("Failed to stat {path:?}")))?
            .len();
        if actual != size as u64 {
            return Err(StorageError::DataCorruption {
                context: format!("index file {path:?}"),
                details: format!("length {actual} does not match configured size {size}"),
            });
        }
        let mapped_file = MappedFile::new(path, 0, size)?;
        // SAFETY: the file is not shared yet.
        let mut header = IndexHeader::decode(unsafe { mapped_file.read_at(0, INDEX_HEADER_SIZE) });
        if header.index_count > index_num {
            warn!(
                "Index file {path:?} claims {} entries but holds at most {index_num}; treating it as full",
                header.index_count
            );
            header.index_count = index_num;
        }
        debug!("Opened index file {path:?} with header {header:?}");
        Ok(Self {
            mapped_file,
            slot_num,
            index_num,
            header: RwLock::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        self.mapped_file.file_name()
    }

    pub fn header(&self) -> IndexHeader {
        *self.header.read()
    }

    pub fn is_write_full(&self) -> bool {
        self.header.read().index_count >= self.index_num
    }

    pub fn end_phy_offset(&self) -> u64 {
        self.header.read().end_phy_offset
    }

    pub fn end_timestamp(&self) -> i64 {
        self.header.read().end_timestamp
    }

    pub fn begin_timestamp(&self) -> i64 {
        self.header.read().begin_timestamp
    }

    fn slot_position(&self, hash: u32) -> usize {
        INDEX_HEADER_SIZE + (hash % self.slot_num) as usize * HASH_SLOT_SIZE
    }

    fn entry_position(&self, index: u32) -> usize {
        INDEX_HEADER_SIZE
            + self.slot_num as usize * HASH_SLOT_SIZE
            + index as usize * INDEX_ENTRY_SIZE
    }

    /// Link a new entry for `key` at the head of its bucket chain.
    pub fn put_key(&self, key: &str, phy_offset: u64, store_timestamp: i64) -> PutKeyOutcome {
        let mut header = self.header.write();
        if header.index_count >= self.index_num {
            return PutKeyOutcome::Full;
        }

        let first_entry = header.index_count == 1;
        let begin_timestamp = if first_entry {
            store_timestamp
        } else {
            header.begin_timestamp
        };
        let delta = (store_timestamp - begin_timestamp).max(0);
        let Ok(time_delta) = u32::try_from(delta) else {
            return PutKeyOutcome::TimeOverflow;
        };

        let hash = index_key_hash(key);
        let slot_pos = self.slot_position(hash);
        // SAFETY: the header write lock excludes every other access to the mapping.
        let mut slot_value = read_u32_at(unsafe { self.mapped_file.read_at(slot_pos, 4) }, 0);
        if slot_value >= header.index_count {
            slot_value = INVALID_INDEX;
        }

        let index = header.index_count;
        let mut entry = [0u8; INDEX_ENTRY_SIZE];
        entry[0..4].copy_from_slice(&hash.to_be_bytes());
        entry[4..12].copy_from_slice(&phy_offset.to_be_bytes());
        entry[12..16].copy_from_slice(&time_delta.to_be_bytes());
        entry[16..20].copy_from_slice(&slot_value.to_be_bytes());

        if first_entry {
            header.begin_timestamp = store_timestamp;
            header.begin_phy_offset = phy_offset;
        }
        if slot_value == INVALID_INDEX {
            header.hash_slot_count += 1;
        }
        header.index_count += 1;
        header.end_phy_offset = phy_offset;
        header.end_timestamp = header.end_timestamp.max(store_timestamp);

        // SAFETY: as above; entry and slot positions are within the file by construction.
        unsafe {
            self.mapped_file
                .write_at(self.entry_position(index), &entry);
            self.mapped_file.write_at(slot_pos, &index.to_be_bytes());
            self.mapped_file.write_at(0, &header.encode());
        }
        PutKeyOutcome::Stored
    }

    /// Whether `[begin, end]` intersects the span of timestamps stored here.
    pub fn is_time_matched(&self, begin: i64, end: i64) -> bool {
        let header = self.header.read();
        header.index_count > 1 && begin <= header.end_timestamp && end >= header.begin_timestamp
    }

    /// Offsets for `key` stored within `[begin, end]`, newest first, at most `max_num`.
    ///
    /// Hash collisions can yield offsets of other keys; callers re-validate.
    pub fn select_phy_offset(&self, key: &str, max_num: usize, begin: i64, end: i64) -> Vec<u64> {
        let header = self.header.read();
        let mut offsets = Vec::new();
        if max_num == 0 || header.index_count <= 1 {
            return offsets;
        }

        let hash = index_key_hash(key);
        // SAFETY: the header read lock excludes `put_key` for the whole walk.
        let mut next = read_u32_at(
            unsafe { self.mapped_file.read_at(self.slot_position(hash), 4) },
            0,
        );

        let mut hops = 0u32;
        let limit = header.index_count.min(self.index_num);
        while next != INVALID_INDEX && next < limit && hops < self.index_num {
            hops += 1;
            let raw = unsafe {
                self.mapped_file
                    .read_at(self.entry_position(next), INDEX_ENTRY_SIZE)
            };
            let entry_hash = read_u32_at(raw, 0);
            let phy_offset = read_u64_at(raw, 4);
            let time_delta = read_u32_at(raw, 12);
            let prev = read_i32_at(raw, 16);

            let timestamp = header.begin_timestamp + time_delta as i64;
            if entry_hash == hash && timestamp >= begin && timestamp <= end {
                offsets.push(phy_offset);
                if offsets.len() >= max_num {
                    break;
                }
            }

            // Chains run newest to oldest; nothing further back can be in the window.
            if prev <= 0 || prev as u32 >= next || timestamp < begin {
                break;
            }
            next = prev as u32;
        }
        offsets
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.header.read();
        self.mapped_file.flush_all()
    }

    pub fn destroy(&self) -> Result<(), StorageError> {
        self.mapped_file.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file(dir: &Path, slots: u32, entries: u32) -> IndexFile {
        IndexFile::create(&dir.join("20240101000000000"), slots, entries).unwrap()
    }

    #[test]
    fn finds_keys_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = new_file(dir.path(), 10, 100);

        file.put_key("t#a", 100, 1_000);
        file.put_key("t#b", 200, 1_001);
        file.put_key("t#a", 300, 1_002);

        assert_eq!(file.select_phy_offset("t#a", 10, 0, i64::MAX), vec![300, 100]);
        assert_eq!(file.select_phy_offset("t#a", 1, 0, i64::MAX), vec![300]);
        assert_eq!(file.select_phy_offset("t#b", 10, 0, i64::MAX), vec![200]);
        assert!(file.select_phy_offset("t#missing", 10, 0, i64::MAX).is_empty());
    }

    #[test]
    fn time_window_filters_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = new_file(dir.path(), 10, 100);
        for i in 0..5u64 {
            file.put_key("t#k", i * 10, 1_000 + i as i64 * 100);
        }

        assert_eq!(file.select_phy_offset("t#k", 10, 1_100, 1_300), vec![30, 20, 10]);
        assert!(file.is_time_matched(1_350, 5_000));
        assert!(!file.is_time_matched(2_000, 3_000));
    }

    #[test]
    fn collisions_share_a_slot_without_losing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = new_file(dir.path(), 1, 100);
        for i in 0..20u64 {
            file.put_key(&format!("t#key-{i}"), i, 1_000);
        }
        for i in 0..20u64 {
            let found = file.select_phy_offset(&format!("t#key-{i}"), 100, 0, i64::MAX);
            assert!(found.contains(&i));
        }
        assert_eq!(file.header().hash_slot_count, 1);
    }

    #[test]
    fn seals_when_full_or_time_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let file = new_file(dir.path(), 4, 3);
        assert_eq!(file.put_key("t#a", 1, 0), PutKeyOutcome::Stored);
        assert_eq!(
            file.put_key("t#b", 2, u32::MAX as i64 + 1),
            PutKeyOutcome::TimeOverflow
        );
        assert_eq!(file.put_key("t#b", 2, 10), PutKeyOutcome::Stored);
        assert_eq!(file.put_key("t#c", 3, 20), PutKeyOutcome::Full);
        assert!(file.is_write_full());
        assert_eq!(file.header().entry_count(), 2);
    }

    #[test]
    fn reopens_with_persisted_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240101000000000");
        {
            let file = IndexFile::create(&path, 10, 100).unwrap();
            file.put_key("t#a", 42, 5_000);
            file.flush().unwrap();
        }
        let file = IndexFile::open(&path, 10, 100).unwrap();
        assert_eq!(file.header().end_phy_offset, 42);
        assert_eq!(file.header().index_count, 2);
        assert_eq!(file.select_phy_offset("t#a", 10, 0, i64::MAX), vec![42]);
    }

    #[test]
    fn corrupt_chain_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let file = new_file(dir.path(), 1, 10);
        file.put_key("t#a", 1, 0);
        file.put_key("t#a", 2, 0);
        // Point entry 2 back at itself.
        unsafe {
            file.mapped_file
                .write_at(file.entry_position(2) + 16, &2u32.to_be_bytes())
        };
        assert_eq!(file.select_phy_offset("t#a", 10, 0, i64::MAX), vec![2]);
    }

    #[test]
    fn oversized_entry_count_is_clamped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240101000000000");
        let hash = index_key_hash("t#a");
        {
            let file = IndexFile::create(&path, 4, 8).unwrap();
            file.put_key("t#a", 7, 1_000);
            unsafe {
                file.mapped_file.write_at(36, &1_000u32.to_be_bytes());
                file.mapped_file
                    .write_at(file.slot_position(hash), &500u32.to_be_bytes());
            }
            file.mapped_file.flush_all().unwrap();
        }

        let file = IndexFile::open(&path, 4, 8).unwrap();
        assert_eq!(file.header().index_count, 8);
        assert!(file.is_write_full());
        assert!(file.select_phy_offset("t#a", 10, 0, i64::MAX).is_empty());
        assert_eq!(file.put_key("t#b", 9, 1_001), PutKeyOutcome::Full);
    }
}
