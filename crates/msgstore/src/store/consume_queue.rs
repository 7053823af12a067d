//! Per topic-queue logical index into the commit log.
//!
//! Entry layout (big-endian): `[8B physical offset][4B size][8B tag hash]`. Entry `n` lives at
//! byte offset `n * 20` across the queue's segments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::file::MappedFileQueue;
use crate::storage::file::common::{read_i64_at, read_u32_at, read_u64_at};
use crate::store::commit_log::TopicQueueKey;
use crate::store::result::SelectMappedBufferResult;

pub const CQ_STORE_UNIT_SIZE: usize = 20;

/// Size marker of a filler entry written to close a gap in logical offsets.
pub const FILLER_SIZE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub commit_log_offset: u64,
    pub size: u32,
    pub tags_code: i64,
}

impl CqEntry {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            commit_log_offset: read_u64_at(buf, 0),
            size: read_u32_at(buf, 8),
            tags_code: read_i64_at(buf, 12),
        }
    }

    pub fn encode(&self) -> [u8; CQ_STORE_UNIT_SIZE] {
        let mut out = [0u8; CQ_STORE_UNIT_SIZE];
        out[..8].copy_from_slice(&self.commit_log_offset.to_be_bytes());
        out[8..12].copy_from_slice(&self.size.to_be_bytes());
        out[12..].copy_from_slice(&self.tags_code.to_be_bytes());
        out
    }

    pub fn filler() -> Self {
        Self {
            commit_log_offset: 0,
            size: FILLER_SIZE,
            tags_code: 0,
        }
    }

    pub fn is_filler(&self) -> bool {
        self.size == FILLER_SIZE
    }

    /// Zeroed space: never written.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn end_offset(&self) -> u64 {
        self.commit_log_offset + self.size as u64
    }
}

/// Appended only by the dispatcher; readers see a consistent prefix.
#[derive(Debug)]
pub struct ConsumeQueue {
    topic: String,
    queue_id: u32,
    mapped_file_queue: MappedFileQueue,
    /// End of the last commit log record indexed here.
    max_physic_offset: AtomicU64,
}

impl ConsumeQueue {
    pub fn new(root: &Path, topic: &str, queue_id: u32, mapped_file_size: usize) -> Self {
        let dir = root.join(topic).join(queue_id.to_string());
        Self {
            topic: topic.to_string(),
            queue_id,
            mapped_file_queue: MappedFileQueue::new(dir, mapped_file_size),
            max_physic_offset: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn load(&self) -> Result<(), StorageError> {
        self.mapped_file_queue.load()
    }

    fn file_size(&self) -> usize {
        self.mapped_file_queue.mapped_file_size()
    }

    pub fn max_physic_offset(&self) -> u64 {
        self.max_physic_offset.load(Ordering::Acquire)
    }

    pub fn get_min_offset_in_queue(&self) -> u64 {
        self.mapped_file_queue.get_min_offset() / CQ_STORE_UNIT_SIZE as u64
    }

    /// One past the last entry.
    pub fn get_max_offset_in_queue(&self) -> u64 {
        self.mapped_file_queue.get_max_offset() / CQ_STORE_UNIT_SIZE as u64
    }

    /// Record the position of one dispatched message at logical offset `cq_offset`.
    ///
    /// Idempotent: an entry already present (by logical or physical position) is skipped.
    /// A gap before `cq_offset` is closed with filler entries.
    pub fn put_message_position_info(
        &self,
        offset: u64,
        size: u32,
        tags_code: i64,
        cq_offset: u64,
    ) -> Result<(), StorageError> {
        if offset + size as u64 <= self.max_physic_offset() {
            debug!(
                "{}:{} already holds commit log offset {offset}",
                self.topic, self.queue_id
            );
            return Ok(());
        }

        let expect_logic_offset = cq_offset * CQ_STORE_UNIT_SIZE as u64;
        let mut current = self.current_logic_offset(expect_logic_offset);
        if expect_logic_offset < current {
            warn!(
                "{}:{} logical offset {cq_offset} already written (queue at {})",
                self.topic,
                self.queue_id,
                current / CQ_STORE_UNIT_SIZE as u64
            );
            self.max_physic_offset
                .fetch_max(offset + size as u64, Ordering::AcqRel);
            return Ok(());
        }
        if expect_logic_offset > current {
            warn!(
                "{}:{} gap between {} and {cq_offset}; padding with filler entries",
                self.topic,
                self.queue_id,
                current / CQ_STORE_UNIT_SIZE as u64
            );
        }
        while current < expect_logic_offset {
            self.append_entry(&CqEntry::filler(), current)?;
            current += CQ_STORE_UNIT_SIZE as u64;
        }

        let entry = CqEntry {
            commit_log_offset: offset,
            size,
            tags_code,
        };
        self.append_entry(&entry, expect_logic_offset)?;
        self.max_physic_offset
            .store(entry.end_offset(), Ordering::Release);
        Ok(())
    }

    /// Byte offset the next entry would land at. A brand-new queue starts at the segment
    /// holding `expected`, with the space before it marked as already written.
    fn current_logic_offset(&self, expected: u64) -> u64 {
        if self.mapped_file_queue.is_empty() {
            return expected - expected % self.file_size() as u64;
        }
        self.mapped_file_queue.get_max_offset()
    }

    fn append_entry(&self, entry: &CqEntry, logic_offset: u64) -> Result<(), StorageError> {
        let mapped_file = self
            .mapped_file_queue
            .get_last_mapped_file_or_create(logic_offset)?;
        let at = mapped_file.file_from_offset() + mapped_file.wrote_position() as u64;
        if at != logic_offset {
            return Err(StorageError::DataCorruption {
                context: format!("consume queue {}:{}", self.topic, self.queue_id),
                details: format!("expected to append at {logic_offset}, segment is at {at}"),
            });
        }
        if !mapped_file.append_message(&entry.encode()) {
            return Err(StorageError::InsufficientSpace {
                context: format!("consume queue {}:{}", self.topic, self.queue_id),
            });
        }
        Ok(())
    }

    /// Entries from `start_index` to the end of the segment that holds it.
    pub fn get_index_buffer(&self, start_index: u64) -> Option<SelectMappedBufferResult> {
        let offset = start_index * CQ_STORE_UNIT_SIZE as u64;
        if offset < self.mapped_file_queue.get_min_offset() {
            return None;
        }
        let mapped_file = self
            .mapped_file_queue
            .find_mapped_file_by_offset(offset, false)?;
        let pos = (offset - mapped_file.file_from_offset()) as usize;
        let wrote = mapped_file.wrote_position();
        if pos >= wrote {
            return None;
        }
        SelectMappedBufferResult::new(mapped_file, pos, wrote - pos)
    }

    pub fn get_entry(&self, index: u64) -> Option<CqEntry> {
        let buffer = self.get_index_buffer(index)?;
        Some(CqEntry::decode(&buffer.as_bytes()[..CQ_STORE_UNIT_SIZE]))
    }

    /// Find the last well-formed entry in the trailing segments and drop everything after.
    #[tracing::instrument(level = "debug", skip(self), fields(topic = %self.topic, queue_id = self.queue_id))]
    pub fn recover(&self) -> Result<(), StorageError> {
        let files = self.mapped_file_queue.mapped_files();
        if files.is_empty() {
            return Ok(());
        }
        let start = files.len().saturating_sub(3);

        let mut process_offset = files[start].file_from_offset();
        let mut max_physic = 0u64;
        'files: for mapped_file in &files[start..] {
            let Some(bytes) = mapped_file.slice_from(0) else {
                break;
            };
            for (i, raw) in bytes.chunks_exact(CQ_STORE_UNIT_SIZE).enumerate() {
                let entry = CqEntry::decode(raw);
                if entry.is_empty() {
                    process_offset =
                        mapped_file.file_from_offset() + (i * CQ_STORE_UNIT_SIZE) as u64;
                    break 'files;
                }
                if !entry.is_filler() {
                    max_physic = entry.end_offset();
                }
            }
            process_offset = mapped_file.file_from_offset() + self.file_size() as u64;
        }

        self.mapped_file_queue.truncate_dirty_files(process_offset)?;
        self.max_physic_offset.store(max_physic, Ordering::Release);
        debug!(
            "Recovered {}:{} to logical offset {}",
            self.topic,
            self.queue_id,
            process_offset / CQ_STORE_UNIT_SIZE as u64
        );
        Ok(())
    }

    /// Remove entries referring to commit log bytes at or beyond `phy_offset`.
    pub fn truncate_dirty_logic_files(&self, phy_offset: u64) -> Result<(), StorageError> {
        let files = self.mapped_file_queue.mapped_files();
        let mut cut = None;
        let mut max_physic = 0u64;

        'files: for mapped_file in files.iter().rev() {
            let Some(bytes) = mapped_file.slice_from(0) else {
                continue;
            };
            let entries = bytes.len() / CQ_STORE_UNIT_SIZE;
            for i in (0..entries).rev() {
                let entry =
                    CqEntry::decode(&bytes[i * CQ_STORE_UNIT_SIZE..(i + 1) * CQ_STORE_UNIT_SIZE]);
                if entry.is_filler() {
                    continue;
                }
                if entry.end_offset() <= phy_offset {
                    max_physic = entry.end_offset();
                    break 'files;
                }
                cut = Some(mapped_file.file_from_offset() + (i * CQ_STORE_UNIT_SIZE) as u64);
            }
        }

        if let Some(cut) = cut {
            info!(
                "Truncating {}:{} at logical offset {} (commit log max {phy_offset})",
                self.topic,
                self.queue_id,
                cut / CQ_STORE_UNIT_SIZE as u64
            );
            self.mapped_file_queue.truncate_dirty_files(cut)?;
        }
        self.max_physic_offset.store(max_physic, Ordering::Release);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.mapped_file_queue.flush(0).map(|_| ())
    }

    pub fn destroy(&self) -> Result<(), StorageError> {
        self.max_physic_offset.store(0, Ordering::Release);
        self.mapped_file_queue.destroy()
    }

    pub fn release(&self) {
        self.mapped_file_queue.shutdown();
    }
}

/// All consume queues, keyed by topic and queue id, under `consumequeue/{topic}/{queueId}/`.
#[derive(Debug)]
pub struct ConsumeQueueTable {
    root: PathBuf,
    mapped_file_size: usize,
    queues: DashMap<TopicQueueKey, Arc<ConsumeQueue>>,
}

impl ConsumeQueueTable {
    pub fn new<P: AsRef<Path>>(root: P, mapped_file_size: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mapped_file_size,
            queues: DashMap::new(),
        }
    }

    pub fn find_or_create(&self, topic: &str, queue_id: u32) -> Arc<ConsumeQueue> {
        if let Some(queue) = self.get(topic, queue_id) {
            return queue;
        }
        Arc::clone(
            self.queues
                .entry((topic.to_string(), queue_id))
                .or_insert_with(|| {
                    Arc::new(ConsumeQueue::new(
                        &self.root,
                        topic,
                        queue_id,
                        self.mapped_file_size,
                    ))
                })
                .value(),
        )
    }

    pub fn get(&self, topic: &str, queue_id: u32) -> Option<Arc<ConsumeQueue>> {
        self.queues
            .get(&(topic.to_string(), queue_id))
            .map(|q| Arc::clone(q.value()))
    }

    pub fn queues(&self) -> Vec<Arc<ConsumeQueue>> {
        self.queues.iter().map(|q| Arc::clone(q.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Discover `{topic}/{queueId}` directories and map their segments.
    #[tracing::instrument(level = "info", skip(self), fields(root = %self.root.display()))]
    pub fn load(&self) -> Result<(), StorageError> {
        if !self.root.exists() {
            return Ok(());
        }
        let topics = std::fs::read_dir(&self.root)
            .map_err(|e| StorageError::from_io_error(e, "Failed to list consume queue root"))?;
        for topic_entry in topics {
            let topic_entry = topic_entry
                .map_err(|e| StorageError::from_io_error(e, "Failed to read topic entry"))?;
            let topic_path = topic_entry.path();
            let Some(topic) = topic_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !topic_path.is_dir() {
                continue;
            }
            let queue_dirs = std::fs::read_dir(&topic_path)
                .map_err(|e| StorageError::from_io_error(e, "Failed to list topic directory"))?;
            for queue_entry in queue_dirs {
                let queue_entry = queue_entry
                    .map_err(|e| StorageError::from_io_error(e, "Failed to read queue entry"))?;
                let Some(queue_id) = queue_entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let queue = self.find_or_create(topic, queue_id);
                queue.load()?;
                info!("Loaded consume queue {topic}:{queue_id}");
            }
        }
        Ok(())
    }

    pub fn recover(&self) -> Result<(), StorageError> {
        for queue in self.queues() {
            queue.recover()?;
        }
        Ok(())
    }

    pub fn truncate_dirty(&self, phy_offset: u64) -> Result<(), StorageError> {
        for queue in self.queues() {
            queue.truncate_dirty_logic_files(phy_offset)?;
        }
        Ok(())
    }

    /// Highest commit log end offset referenced by any queue.
    pub fn max_physic_offset(&self) -> u64 {
        self.queues()
            .iter()
            .map(|q| q.max_physic_offset())
            .max()
            .unwrap_or(0)
    }

    /// Next logical offset per queue, used to seed the commit log after recovery.
    pub fn queue_offset_table(&self) -> HashMap<TopicQueueKey, u64> {
        self.queues()
            .iter()
            .map(|q| {
                (
                    (q.topic().to_string(), q.queue_id()),
                    q.get_max_offset_in_queue(),
                )
            })
            .collect()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        for queue in self.queues() {
            queue.flush()?;
        }
        Ok(())
    }

    pub fn destroy(&self) -> Result<(), StorageError> {
        for queue in self.queues() {
            queue.destroy()?;
        }
        self.queues.clear();
        crate::storage::file::FileIo::remove_dir_all_if_exists(&self.root)
    }

    pub fn release(&self) {
        for queue in self.queues() {
            queue.release();
        }
        self.queues.clear();
    }
}
