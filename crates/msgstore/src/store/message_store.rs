use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::StoreConfig;
use crate::error::{StorageError, StoreError};
use crate::message::{Message, MessageExt, decode_message, decode_message_id};
use crate::storage::file::common::now_millis;
use crate::storage::file::{DirectoryLock, FileIo};
use crate::store::checkpoint::StoreCheckpoint;
use crate::store::commit_log::CommitLog;
use crate::store::consume_queue::{CQ_STORE_UNIT_SIZE, ConsumeQueueTable, CqEntry};
use crate::store::dispatch::{
    CommitLogDispatcher, ConsumeQueueDispatcher, IndexDispatcher, ReputMessageService,
};
use crate::store::filter::MessageFilter;
use crate::store::flush::FlushConsumeQueueService;
use crate::store::index_service::IndexService;
use crate::store::result::{
    GetMessageResult, GetMessageStatus, PutMessageResult, PutMessageStatus, QueryMessageResult,
};
use crate::store::stats::{StatsSink, StoreStatsService};

/// Upper bound on consume queue entries inspected by one get, matched or not.
const MAX_FILTER_SCAN_ENTRIES: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Created,
    Loaded,
    Running,
    ShuttingDown,
    Shutdown,
}

/// Everything that exists between `load` and `shutdown`.
struct StoreComponents {
    checkpoint: Arc<StoreCheckpoint>,
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueTable>,
    index_service: Arc<IndexService>,
    reput: Arc<ReputMessageService>,
    flush_consume_queue: Arc<FlushConsumeQueueService>,
    _lock: DirectoryLock,
}

/// The message store: commit log, consume queues, key index and their background services.
pub struct DefaultMessageStore {
    config: StoreConfig,
    stats: Arc<dyn StatsSink>,
    stats_service: Option<Arc<StoreStatsService>>,
    state: Mutex<StoreState>,
    accepting: AtomicBool,
    /// Puts and gets hold the read side for their whole duration; shutdown takes the write
    /// side to wait out in-flight requests.
    components: RwLock<Option<Arc<StoreComponents>>>,
}

impl DefaultMessageStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let stats_service = Arc::new(StoreStatsService::new());
        Ok(Self {
            config,
            stats: Arc::clone(&stats_service) as Arc<dyn StatsSink>,
            stats_service: Some(stats_service),
            state: Mutex::new(StoreState::Created),
            accepting: AtomicBool::new(false),
            components: RwLock::new(None),
        })
    }

    /// Use `stats` instead of the built-in stats service.
    pub fn with_stats_sink(
        config: StoreConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            config,
            stats,
            stats_service: None,
            state: Mutex::new(StoreState::Created),
            accepting: AtomicBool::new(false),
            components: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    pub fn stats_service(&self) -> Option<&Arc<StoreStatsService>> {
        self.stats_service.as_ref()
    }

    fn components(&self) -> Option<Arc<StoreComponents>> {
        self.components.read().clone()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Map and recover all on-disk state and catch the consume queues and index up with the
    /// commit log.
    ///
    /// Returns `Ok(false)` when recovery had to discard more flushed data than
    /// `max_recovery_truncate_bytes` allows; the store then stays in `Created`.
    #[tracing::instrument(
        level = "info",
        skip(self),
        fields(root = %self.config.store_path_root_dir.display())
    )]
    pub fn load(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if *state != StoreState::Created {
            return Err(StoreError::unavailable(format!(
                "load requires a created store, current state is {:?}",
                *state
            )));
        }

        let lock = DirectoryLock::acquire(&self.config.store_path_root_dir)?;
        let last_exit_ok = !self.config.abort_path().exists();
        if !last_exit_ok {
            warn!("Abort file found, the previous run did not shut down cleanly");
        }

        let checkpoint = Arc::new(StoreCheckpoint::load(self.config.checkpoint_path())?);
        let commit_log = Arc::new(CommitLog::new(&self.config, Arc::clone(&checkpoint)));
        let consume_queues = Arc::new(ConsumeQueueTable::new(
            self.config.consume_queue_dir(),
            self.config.consume_queue_file_size(),
        ));
        let index_service = Arc::new(IndexService::new(
            self.config.index_dir(),
            self.config.max_hash_slot_num,
            self.config.max_index_num,
        ));

        commit_log.load()?;
        consume_queues.load()?;

        let saved = checkpoint.snapshot();
        let recovered = if last_exit_ok {
            commit_log.recover_normally()?
        } else {
            commit_log.recover_abnormally(saved.physic_flushed_offset)?
        };
        let truncated = saved.physic_flushed_offset.saturating_sub(recovered);
        if truncated > self.config.max_recovery_truncate_bytes {
            error!(
                "Recovery would discard {truncated} flushed bytes (checkpoint {}, \
                 recovered {recovered}), refusing to load",
                saved.physic_flushed_offset
            );
            consume_queues.release();
            commit_log.release();
            return Ok(false);
        }

        consume_queues.recover()?;
        consume_queues.truncate_dirty(recovered)?;
        let index_rebuild_from = if self.config.message_index_enable {
            index_service.load(last_exit_ok, saved.index_msg_timestamp, recovered)?
        } else {
            None
        };
        checkpoint.reset(recovered, recovered);

        let min_offset = commit_log.get_min_offset();
        let mut resume = if checkpoint.existed() {
            saved.dispatched_offset
        } else {
            min_offset
        };
        if let Some(rebuild_from) = index_rebuild_from {
            resume = resume.min(rebuild_from);
        }
        let resume = resume.min(recovered).max(min_offset);

        let mut dispatchers: Vec<Arc<dyn CommitLogDispatcher>> =
            vec![Arc::new(ConsumeQueueDispatcher::new(Arc::clone(&consume_queues)))];
        if self.config.message_index_enable {
            dispatchers.push(Arc::new(IndexDispatcher::new(Arc::clone(&index_service))));
        }
        let reput = Arc::new(ReputMessageService::new(
            Arc::clone(&commit_log),
            dispatchers,
            Arc::clone(&self.stats),
            self.config.dispatch_poll_interval(),
        ));
        reput.set_reput_from_offset(resume);
        let replayed = reput.do_reput()?;
        info!(
            "Dispatched {replayed} records from {resume} during load, commit log max {recovered}"
        );
        commit_log.set_topic_queue_table(consume_queues.queue_offset_table());

        let flush_consume_queue = Arc::new(FlushConsumeQueueService::new(
            Arc::clone(&consume_queues),
            Arc::clone(&index_service),
            Arc::clone(&reput),
            Arc::clone(&checkpoint),
            self.config.flush_consume_queue_interval(),
        ));

        *self.components.write() = Some(Arc::new(StoreComponents {
            checkpoint,
            commit_log,
            consume_queues,
            index_service,
            reput,
            flush_consume_queue,
            _lock: lock,
        }));
        *state = StoreState::Loaded;
        info!(
            "Store loaded (last exit {}), commit log [{min_offset}, {recovered})",
            if last_exit_ok { "clean" } else { "abnormal" }
        );
        Ok(true)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn start(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if *state != StoreState::Loaded {
            return Err(StoreError::unavailable(format!(
                "start requires a loaded store, current state is {:?}",
                *state
            )));
        }
        let components = self
            .components()
            .ok_or_else(|| StoreError::unavailable("store components missing"))?;

        FileIo::write_atomically(&self.config.abort_path(), &[])?;
        components.commit_log.start()?;
        ReputMessageService::start(&components.reput)?;
        FlushConsumeQueueService::start(&components.flush_consume_queue)?;
        if let Some(stats_service) = &self.stats_service {
            StoreStatsService::start(stats_service)?;
        }

        self.accepting.store(true, Ordering::Release);
        *state = StoreState::Running;
        info!("Store started");
        Ok(())
    }

    /// Stop accepting requests, drain flush waiters, let the dispatcher catch up, flush
    /// everything and release the mappings. A no-op unless loaded or running.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let was_running = match *state {
            StoreState::Running => true,
            StoreState::Loaded => false,
            _ => return,
        };
        *state = StoreState::ShuttingDown;
        self.accepting.store(false, Ordering::Release);

        let Some(components) = self.components.write().take() else {
            *state = StoreState::Shutdown;
            return;
        };

        if was_running {
            if let Some(stats_service) = &self.stats_service {
                stats_service.shutdown();
            }
            components.reput.shutdown();
            components.commit_log.shutdown();
            components.flush_consume_queue.shutdown();
        }

        let clean = match self.final_flush(&components) {
            Ok(()) => true,
            Err(e) => {
                error!("Final flush failed, next start will recover abnormally: {e}");
                false
            }
        };

        components.index_service.shutdown();
        components.consume_queues.release();
        components.commit_log.release();

        if clean && was_running {
            if let Err(e) = FileIo::remove_file_if_exists(&self.config.abort_path()) {
                warn!("Failed to remove abort file: {e}");
            }
        }
        drop(components);
        *state = StoreState::Shutdown;
        info!("Store shut down");
    }

    fn final_flush(&self, components: &StoreComponents) -> Result<(), StorageError> {
        let queue = components.commit_log.mapped_file_queue();
        let flushed = queue.flush(0)?;
        components
            .checkpoint
            .set_physic_flushed(flushed, now_millis());

        components.consume_queues.flush()?;
        components.index_service.flush()?;
        components.checkpoint.set_dispatched(
            components.reput.reput_from_offset(),
            components.reput.last_dispatched_timestamp(),
        );
        components.checkpoint.flush()
    }

    /// Delete every persisted file and return to `Created`.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.shutdown();
        let mut state = self.state.lock();
        {
            let _lock = DirectoryLock::acquire(&self.config.store_path_root_dir)?;
            FileIo::remove_dir_all_if_exists(&self.config.commit_log_dir())?;
            FileIo::remove_dir_all_if_exists(&self.config.consume_queue_dir())?;
            FileIo::remove_dir_all_if_exists(&self.config.index_dir())?;
            FileIo::remove_file_if_exists(&self.config.checkpoint_path())?;
            FileIo::remove_file_if_exists(&self.config.abort_path())?;
        }
        *state = StoreState::Created;
        info!("Store destroyed");
        Ok(())
    }

    // =========================================================================
    // WRITE PATH
    // =========================================================================

    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        let started = Instant::now();
        let guard = self.components.read();
        let components = match guard.as_ref() {
            Some(components) if self.accepting.load(Ordering::Acquire) => components,
            _ => {
                warn!("Rejected put for topic '{}': store is not running", msg.topic);
                return PutMessageResult::failed(PutMessageStatus::ServiceNotAvailable);
            }
        };

        let result = components.commit_log.put_message(msg);
        let appended = result.status.is_appended();
        if appended {
            components.reput.wakeup();
        }
        let size = result
            .append_result
            .as_ref()
            .map(|r| r.wrote_bytes)
            .unwrap_or(0);
        self.stats
            .on_put(appended, started.elapsed().as_millis() as u64, size);
        result
    }

    // =========================================================================
    // READ PATH
    // =========================================================================

    /// Read up to `max_msg_nums` messages of one queue starting at logical `offset`.
    pub fn get_message(
        &self,
        topic: &str,
        queue_id: u32,
        offset: u64,
        max_msg_nums: usize,
        filter: Option<&dyn MessageFilter>,
    ) -> Result<GetMessageResult, StoreError> {
        let started = Instant::now();
        let guard = self.components.read();
        let components = match guard.as_ref() {
            Some(components) if self.accepting.load(Ordering::Acquire) => components,
            _ => return Err(StoreError::unavailable("get on a store that is not running")),
        };

        let result =
            self.get_message_from(components, topic, queue_id, offset, max_msg_nums, filter);
        self.stats.on_get(
            result.status == GetMessageStatus::Found,
            result.message_count(),
            started.elapsed().as_millis() as u64,
        );
        Ok(result)
    }

    fn get_message_from(
        &self,
        components: &StoreComponents,
        topic: &str,
        queue_id: u32,
        offset: u64,
        max_msg_nums: usize,
        filter: Option<&dyn MessageFilter>,
    ) -> GetMessageResult {
        let Some(queue) = components.consume_queues.get(topic, queue_id) else {
            return GetMessageResult::empty(GetMessageStatus::NoMatchedLogicQueue, 0, 0, 0);
        };
        let min = queue.get_min_offset_in_queue();
        let max = queue.get_max_offset_in_queue();

        if max == 0 {
            return GetMessageResult::empty(GetMessageStatus::NoMatchedLogicQueue, 0, min, max);
        }
        if offset < min {
            return GetMessageResult::empty(GetMessageStatus::OffsetTooSmall, min, min, max);
        }
        if offset >= max {
            let next = offset.min(max);
            return GetMessageResult::empty(GetMessageStatus::OffsetNotYetAvailable, next, min, max);
        }

        let Some(index_buffer) = queue.get_index_buffer(offset) else {
            return GetMessageResult::empty(GetMessageStatus::MessageWasRemoving, offset, min, max);
        };

        let max_count = max_msg_nums
            .min(self.config.max_transfer_count_on_message)
            .max(1);
        let mut result =
            GetMessageResult::empty(GetMessageStatus::NoMatchedMessage, offset, min, max);
        let mut miss_status = GetMessageStatus::NoMatchedMessage;
        let mut next_offset = offset;

        for raw in index_buffer
            .as_bytes()
            .chunks_exact(CQ_STORE_UNIT_SIZE)
            .take(MAX_FILTER_SCAN_ENTRIES)
        {
            let entry = CqEntry::decode(raw);
            if entry.is_empty() {
                break;
            }
            if !entry.is_filler() {
                let over_bytes = !result.messages.is_empty()
                    && result.buffer_total_size + entry.size as usize
                        > self.config.max_transfer_bytes_on_message;
                if result.messages.len() >= max_count || over_bytes {
                    break;
                }
                if filter.is_none_or(|f| f.is_matched(entry.tags_code)) {
                    match components
                        .commit_log
                        .get_message(entry.commit_log_offset, entry.size as usize)
                    {
                        Some(buffer) => {
                            result.buffer_total_size += buffer.size();
                            result.messages.push(buffer);
                        }
                        None => {
                            if result.messages.is_empty() {
                                miss_status = GetMessageStatus::MessageWasRemoving;
                            }
                        }
                    }
                }
            }
            next_offset += 1;
        }

        result.next_begin_offset = next_offset;
        result.status = if result.messages.is_empty() {
            miss_status
        } else {
            GetMessageStatus::Found
        };
        result
    }

    /// Messages whose `topic#key` index entry falls in `[begin, end]`, newest first.
    ///
    /// Index hits are re-checked against the decoded record, so hash collisions are dropped.
    pub fn query_message(
        &self,
        topic: &str,
        key: &str,
        max_num: usize,
        begin: i64,
        end: i64,
    ) -> Result<QueryMessageResult, StoreError> {
        let components = self
            .components()
            .ok_or_else(|| StoreError::unavailable("query on a store that is not loaded"))?;
        let mut result = QueryMessageResult::default();
        if !self.config.message_index_enable {
            return Ok(result);
        }

        let offsets = components
            .index_service
            .query_offset(topic, key, max_num, begin, end);
        result.index_last_update_timestamp = offsets.index_last_update_timestamp;
        result.index_last_update_phy_offset = offsets.index_last_update_phy_offset;

        for phy_offset in offsets.phy_offsets {
            let Some(buffer) = components.commit_log.get_message_at(phy_offset) else {
                continue;
            };
            let matches = match decode_message(buffer.as_bytes()) {
                Ok(ext) => ext.message.topic == topic && ext.message.keys().contains(&key),
                Err(e) => {
                    warn!("Index points at an unreadable record at {phy_offset}: {e}");
                    false
                }
            };
            if matches {
                result.buffer_total_size += buffer.size();
                result.messages.push(buffer);
            }
        }
        Ok(result)
    }

    /// Decode the record starting at commit log offset `phy_offset`.
    pub fn look_message_by_offset(&self, phy_offset: u64) -> Option<MessageExt> {
        let components = self.components()?;
        let buffer = components.commit_log.get_message_at(phy_offset)?;
        match decode_message(buffer.as_bytes()) {
            Ok(ext) => Some(ext),
            Err(e) => {
                warn!("No readable record at {phy_offset}: {e}");
                None
            }
        }
    }

    pub fn view_message_by_id(&self, msg_id: &str) -> Result<MessageExt, StoreError> {
        let (_, phy_offset) = decode_message_id(msg_id)?;
        self.look_message_by_offset(phy_offset)
            .ok_or_else(|| StoreError::NotFound {
                context: format!("message {msg_id} at offset {phy_offset}"),
            })
    }

    pub fn get_max_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.components()
            .and_then(|c| c.consume_queues.get(topic, queue_id))
            .map(|q| q.get_max_offset_in_queue())
            .unwrap_or(0)
    }

    pub fn get_min_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.components()
            .and_then(|c| c.consume_queues.get(topic, queue_id))
            .map(|q| q.get_min_offset_in_queue())
            .unwrap_or(0)
    }

    /// Commit log offset of the message at logical `consume_offset`, if present.
    pub fn get_commit_log_offset_in_queue(
        &self,
        topic: &str,
        queue_id: u32,
        consume_offset: u64,
    ) -> Option<u64> {
        let entry = self
            .components()?
            .consume_queues
            .get(topic, queue_id)?
            .get_entry(consume_offset)?;
        (!entry.is_filler() && !entry.is_empty()).then_some(entry.commit_log_offset)
    }

    pub fn get_max_phy_offset(&self) -> u64 {
        self.components()
            .map(|c| c.commit_log.get_max_offset())
            .unwrap_or(0)
    }

    pub fn get_min_phy_offset(&self) -> u64 {
        self.components()
            .map(|c| c.commit_log.get_min_offset())
            .unwrap_or(0)
    }

    pub fn dispatch_behind_bytes(&self) -> u64 {
        self.components()
            .map(|c| c.reput.dispatch_behind_bytes())
            .unwrap_or(0)
    }

    pub fn runtime_info(&self) -> BTreeMap<String, String> {
        let mut info = self
            .stats_service
            .as_ref()
            .map(|s| s.runtime_info())
            .unwrap_or_default();
        info.insert("storeState".to_string(), format!("{:?}", self.state()));
        if let Some(components) = self.components() {
            let checkpoint = components.checkpoint.snapshot();
            info.insert(
                "commitLogMinOffset".to_string(),
                components.commit_log.get_min_offset().to_string(),
            );
            info.insert(
                "commitLogMaxOffset".to_string(),
                components.commit_log.get_max_offset().to_string(),
            );
            info.insert(
                "commitLogFlushedOffset".to_string(),
                components.commit_log.flushed_where().to_string(),
            );
            info.insert(
                "dispatchBehindBytes".to_string(),
                components.reput.dispatch_behind_bytes().to_string(),
            );
            info.insert(
                "checkpointDispatchedOffset".to_string(),
                checkpoint.dispatched_offset.to_string(),
            );
            info.insert(
                "consumeQueueCount".to_string(),
                components.consume_queues.len().to_string(),
            );
            info.insert(
                "indexFileCount".to_string(),
                components.index_service.file_count().to_string(),
            );
        }
        info
    }
}

impl Drop for DefaultMessageStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
