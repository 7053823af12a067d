use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{StorageError, StoreError};
use crate::message::{
    END_FILE_MIN_BLANK_LENGTH, Message, RecordScan, check_message_and_return_size,
    create_message_id, encode_blank_marker, encode_message, patch_record,
};
use crate::storage::file::common::{now_millis, read_u32_at};
use crate::storage::file::{MappedFile, MappedFileQueue};
use crate::store::checkpoint::StoreCheckpoint;
use crate::store::flush::FlushService;
use crate::store::result::{
    AppendMessageResult, PutMessageResult, PutMessageStatus, SelectMappedBufferResult,
};

pub type TopicQueueKey = (String, u32);

/// How many trailing segments a clean restart re-validates.
const NORMAL_RECOVERY_SEGMENTS: usize = 3;

/// The single global append-only log.
pub struct CommitLog {
    mapped_file_queue: Arc<MappedFileQueue>,
    /// Next logical offset per topic queue; the mutex is the append lock.
    topic_queue_table: Mutex<HashMap<TopicQueueKey, u64>>,
    flush_service: FlushService,
    store_host: SocketAddrV4,
    max_message_size: usize,
}

impl CommitLog {
    pub fn new(config: &StoreConfig, checkpoint: Arc<StoreCheckpoint>) -> Self {
        let mapped_file_queue = Arc::new(MappedFileQueue::new(
            config.commit_log_dir(),
            config.mapped_file_size_commit_log,
        ));
        let flush_service = FlushService::new(config, Arc::clone(&mapped_file_queue), checkpoint);
        Self {
            mapped_file_queue,
            topic_queue_table: Mutex::new(HashMap::new()),
            flush_service,
            store_host: config.store_host,
            max_message_size: config.max_message_size,
        }
    }

    pub fn load(&self) -> Result<(), StorageError> {
        self.mapped_file_queue.load()
    }

    pub fn start(&self) -> Result<(), StorageError> {
        self.flush_service.start()
    }

    /// Stop the flush service, resolving every pending waiter.
    pub fn shutdown(&self) {
        self.flush_service.shutdown();
    }

    pub fn mapped_file_queue(&self) -> &Arc<MappedFileQueue> {
        &self.mapped_file_queue
    }

    pub fn mapped_file_size(&self) -> usize {
        self.mapped_file_queue.mapped_file_size()
    }

    pub fn get_min_offset(&self) -> u64 {
        self.mapped_file_queue.get_min_offset()
    }

    pub fn get_max_offset(&self) -> u64 {
        self.mapped_file_queue.get_max_offset()
    }

    pub fn flushed_where(&self) -> u64 {
        self.mapped_file_queue.flushed_where()
    }

    /// First offset of the segment after the one holding `offset`.
    pub fn roll_next_file(&self, offset: u64) -> u64 {
        let size = self.mapped_file_size() as u64;
        offset + size - offset % size
    }

    pub fn set_topic_queue_table(&self, table: HashMap<TopicQueueKey, u64>) {
        *self.topic_queue_table.lock() = table;
    }

    pub fn topic_queue_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.topic_queue_table
            .lock()
            .get(&(topic.to_string(), queue_id))
            .copied()
            .unwrap_or(0)
    }

    /// Append a message, then wait for or schedule the flush per the configured policy.
    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        let started = Instant::now();

        let mut record = match encode_message(msg, &self.store_host, self.max_message_size) {
            Ok(record) => record,
            Err(e) => {
                if e.is_client_error() {
                    warn!("Rejected message for topic '{}': {e}", msg.topic);
                } else {
                    error!("Failed to encode message for topic '{}': {e}", msg.topic);
                }
                return PutMessageResult::failed(PutMessageStatus::from_error(&e));
            }
        };
        if record.len() + END_FILE_MIN_BLANK_LENGTH > self.mapped_file_size() {
            warn!(
                "Rejected message for topic '{}': record of {} bytes cannot fit a segment",
                msg.topic,
                record.len()
            );
            return PutMessageResult::failed(PutMessageStatus::MessageIllegal);
        }

        let mut append_result = match self.append_record(msg, &mut record) {
            Ok(result) => result,
            Err(e) => {
                if e.is_retriable() {
                    warn!("Append failed for topic '{}', may be retried: {e}", msg.topic);
                } else {
                    error!("Append failed for topic '{}': {e}", msg.topic);
                }
                return PutMessageResult::failed(PutMessageStatus::from_error(&e));
            }
        };

        let status = self.handle_disk_flush(&append_result);
        append_result.elapsed_ms = started.elapsed().as_millis() as u64;
        PutMessageResult::new(status, Some(append_result))
    }

    fn append_record(
        &self,
        msg: &Message,
        record: &mut [u8],
    ) -> Result<AppendMessageResult, StoreError> {
        let mut table = self.topic_queue_table.lock();
        let key = (msg.topic.clone(), msg.queue_id);
        let queue_offset = table.get(&key).copied().unwrap_or(0);
        let store_timestamp = now_millis();

        let mapped_file = self.last_mapped_file_for(record.len())?;
        let wrote_offset = mapped_file.file_from_offset() + mapped_file.wrote_position() as u64;

        patch_record(record, queue_offset, wrote_offset, store_timestamp);
        if !mapped_file.append_message(record) {
            return Err(StoreError::corruption(
                "commit log append",
                format!("record of {} bytes rejected at {wrote_offset}", record.len()),
            ));
        }
        table.insert(key, queue_offset + 1);

        Ok(AppendMessageResult {
            wrote_offset,
            wrote_bytes: record.len(),
            msg_id: create_message_id(&self.store_host, wrote_offset),
            store_timestamp,
            logics_offset: queue_offset,
            elapsed_ms: 0,
        })
    }

    /// The active segment with room for `len` bytes plus an end marker; seals a segment that
    /// is too full. Caller holds the append lock.
    fn last_mapped_file_for(&self, len: usize) -> Result<Arc<MappedFile>, StoreError> {
        let allocate = |queue: &MappedFileQueue| {
            queue
                .get_last_mapped_file_or_create(0)
                .map_err(|e| StoreError::SegmentAllocationFailed {
                    path: queue.store_path().display().to_string(),
                    reason: e.to_string(),
                })
        };

        let mapped_file = allocate(&self.mapped_file_queue)?;
        let remaining = mapped_file.remaining();
        if len + END_FILE_MIN_BLANK_LENGTH <= remaining {
            return Ok(mapped_file);
        }

        mapped_file.fill_blank(&encode_blank_marker(remaining))?;
        info!(
            "Sealed commit log segment {:?} with {remaining} blank bytes",
            mapped_file.file_name()
        );
        allocate(&self.mapped_file_queue)
    }

    fn handle_disk_flush(&self, result: &AppendMessageResult) -> PutMessageStatus {
        match &self.flush_service {
            FlushService::Sync(service) => {
                let required = result.wrote_offset + result.wrote_bytes as u64;
                let receiver = service.put_request(required);
                match receiver.recv_timeout(service.timeout()) {
                    Ok(true) => PutMessageStatus::PutOk,
                    Ok(false) | Err(_) => {
                        let timeout = StoreError::FlushTimeout { offset: required };
                        warn!("{timeout} ({:?})", service.timeout());
                        PutMessageStatus::from_error(&timeout)
                    }
                }
            }
            FlushService::Async(service) => {
                service.wakeup();
                PutMessageStatus::PutOk
            }
        }
    }

    /// Bytes `[offset, offset + size)`, which must lie in one segment.
    pub fn get_message(&self, offset: u64, size: usize) -> Option<SelectMappedBufferResult> {
        let mapped_file = self
            .mapped_file_queue
            .find_mapped_file_by_offset(offset, false)?;
        let pos = offset.checked_sub(mapped_file.file_from_offset())? as usize;
        SelectMappedBufferResult::new(mapped_file, pos, size)
    }

    /// All published bytes from `offset` to the end of its segment's written region.
    pub fn get_data(&self, offset: u64) -> Option<SelectMappedBufferResult> {
        let mapped_file = self
            .mapped_file_queue
            .find_mapped_file_by_offset(offset, false)?;
        let pos = offset.checked_sub(mapped_file.file_from_offset())? as usize;
        let wrote = mapped_file.wrote_position();
        if pos > wrote {
            return None;
        }
        SelectMappedBufferResult::new(mapped_file, pos, wrote - pos)
    }

    /// The whole record starting at `offset`, sized by its length prefix.
    pub fn get_message_at(&self, offset: u64) -> Option<SelectMappedBufferResult> {
        let header = self.get_message(offset, 4)?;
        let size = read_u32_at(header.as_bytes(), 0) as usize;
        if size < END_FILE_MIN_BLANK_LENGTH {
            return None;
        }
        self.get_message(offset, size)
    }

    /// Validate the last few segments after a clean shutdown.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn recover_normally(&self) -> Result<u64, StoreError> {
        let files = self.mapped_file_queue.mapped_files();
        let start = files.len().saturating_sub(NORMAL_RECOVERY_SEGMENTS);
        self.recover_from(&files, start)
    }

    /// Validate forward from the segment holding the last checkpointed flush offset.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn recover_abnormally(&self, checkpoint_flushed: u64) -> Result<u64, StoreError> {
        let files = self.mapped_file_queue.mapped_files();
        let start = files
            .iter()
            .rposition(|f| f.file_from_offset() <= checkpoint_flushed)
            .unwrap_or(0);
        self.recover_from(&files, start)
    }

    fn recover_from(&self, files: &[Arc<MappedFile>], start: usize) -> Result<u64, StoreError> {
        let Some(first) = files.get(start) else {
            self.mapped_file_queue.set_flushed_where(0);
            self.mapped_file_queue.truncate_dirty_files(0)?;
            return Ok(0);
        };

        let mut process_offset = first.file_from_offset();
        let mut records = 0usize;
        'files: for mapped_file in &files[start..] {
            process_offset = mapped_file.file_from_offset();
            let Some(bytes) = mapped_file.slice_from(0) else {
                break;
            };
            let mut pos = 0usize;
            while pos < bytes.len() {
                match check_message_and_return_size(&bytes[pos..], true) {
                    RecordScan::Record(req) => {
                        let expected = mapped_file.file_from_offset() + pos as u64;
                        if req.commit_log_offset != expected {
                            warn!(
                                "Record at {expected} claims physical offset {}; truncating",
                                req.commit_log_offset
                            );
                            break 'files;
                        }
                        pos += req.msg_size as usize;
                        records += 1;
                        process_offset = expected + req.msg_size as u64;
                    }
                    RecordScan::Blank { .. } => {
                        process_offset = mapped_file.file_from_offset() + bytes.len() as u64;
                        continue 'files;
                    }
                    RecordScan::End => break 'files,
                    RecordScan::Corrupt { details } => {
                        warn!(
                            "Corrupt record at {}: {details}; truncating",
                            mapped_file.file_from_offset() + pos as u64
                        );
                        break 'files;
                    }
                }
            }
        }

        info!("Recovered commit log to offset {process_offset} ({records} records validated)");
        self.mapped_file_queue.truncate_dirty_files(process_offset)?;
        self.mapped_file_queue.set_flushed_where(process_offset);
        Ok(process_offset)
    }

    pub fn destroy(&self) -> Result<(), StorageError> {
        self.topic_queue_table.lock().clear();
        self.mapped_file_queue.destroy()
    }

    /// Release mappings after the final flush.
    pub fn release(&self) {
        self.mapped_file_queue.shutdown();
    }
}
