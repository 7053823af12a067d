use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::message::{DispatchRequest, RecordScan, check_message_and_return_size};
use crate::store::commit_log::CommitLog;
use crate::store::consume_queue::ConsumeQueueTable;
use crate::store::index_service::IndexService;
use crate::store::service::ServiceThread;
use crate::store::stats::StatsSink;

/// A derived structure fed by the dispatcher, once per committed record.
///
/// Implementations must tolerate seeing the same record again after a restart.
pub trait CommitLogDispatcher: Send + Sync {
    fn dispatch(&self, request: &DispatchRequest) -> Result<(), StorageError>;
}

pub struct ConsumeQueueDispatcher {
    consume_queues: Arc<ConsumeQueueTable>,
}

impl ConsumeQueueDispatcher {
    pub fn new(consume_queues: Arc<ConsumeQueueTable>) -> Self {
        Self { consume_queues }
    }
}

impl CommitLogDispatcher for ConsumeQueueDispatcher {
    fn dispatch(&self, request: &DispatchRequest) -> Result<(), StorageError> {
        self.consume_queues
            .find_or_create(&request.topic, request.queue_id)
            .put_message_position_info(
                request.commit_log_offset,
                request.msg_size,
                request.tags_code,
                request.consume_queue_offset,
            )
    }
}

pub struct IndexDispatcher {
    index_service: Arc<IndexService>,
}

impl IndexDispatcher {
    pub fn new(index_service: Arc<IndexService>) -> Self {
        Self { index_service }
    }
}

impl CommitLogDispatcher for IndexDispatcher {
    fn dispatch(&self, request: &DispatchRequest) -> Result<(), StorageError> {
        self.index_service.build_index(request)
    }
}

/// Tails the commit log from `reput_from_offset` and feeds every record to the dispatchers.
///
/// `reput_from_offset` only advances past a record once every dispatcher accepted it, and never
/// passes the commit log's published max offset.
pub struct ReputMessageService {
    commit_log: Arc<CommitLog>,
    dispatchers: Vec<Arc<dyn CommitLogDispatcher>>,
    reput_from_offset: AtomicU64,
    last_dispatched_timestamp: AtomicI64,
    stats: Arc<dyn StatsSink>,
    poll_interval: Duration,
    /// Serializes scans between the background loop and synchronous catch-ups.
    reput_lock: Mutex<()>,
    thread: ServiceThread,
}

impl ReputMessageService {
    pub fn new(
        commit_log: Arc<CommitLog>,
        dispatchers: Vec<Arc<dyn CommitLogDispatcher>>,
        stats: Arc<dyn StatsSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            commit_log,
            dispatchers,
            reput_from_offset: AtomicU64::new(0),
            last_dispatched_timestamp: AtomicI64::new(0),
            stats,
            poll_interval,
            reput_lock: Mutex::new(()),
            thread: ServiceThread::new("ReputMessageService"),
        }
    }

    pub fn set_reput_from_offset(&self, offset: u64) {
        self.reput_from_offset.store(offset, Ordering::Release);
    }

    pub fn reput_from_offset(&self) -> u64 {
        self.reput_from_offset.load(Ordering::Acquire)
    }

    pub fn last_dispatched_timestamp(&self) -> i64 {
        self.last_dispatched_timestamp.load(Ordering::Acquire)
    }

    pub fn dispatch_behind_bytes(&self) -> u64 {
        self.commit_log
            .get_max_offset()
            .saturating_sub(self.reput_from_offset())
    }

    pub fn start(service: &Arc<Self>) -> Result<(), StorageError> {
        let this = Arc::clone(service);
        service.thread.start(move || this.run())
    }

    pub fn wakeup(&self) {
        self.thread.wakeup();
    }

    fn run(&self) {
        info!("{} service started", self.thread.name());
        while !self.thread.is_stopped() {
            self.thread.wait_for_running(self.poll_interval);
            if let Err(e) = self.do_reput() {
                warn!("{} dispatch failed: {e}", self.thread.name());
            }
            self.stats.on_dispatch_behind(self.dispatch_behind_bytes());
        }
        info!("{} service end", self.thread.name());
    }

    /// Stop the loop, then dispatch whatever was appended before the stop.
    pub fn shutdown(&self) {
        self.thread.shutdown();
        match self.do_reput() {
            Ok(_) => {}
            Err(e) => error!("{} final catch-up failed: {e}", self.thread.name()),
        }
        let behind = self.dispatch_behind_bytes();
        if behind > 0 {
            warn!(
                "{} stopped {behind} bytes behind the commit log at {}",
                self.thread.name(),
                self.reput_from_offset()
            );
        }
    }

    /// Dispatch every published record past `reput_from_offset`. Returns the number dispatched.
    pub fn do_reput(&self) -> Result<usize, StorageError> {
        let _guard = self.reput_lock.lock();
        let min_offset = self.commit_log.get_min_offset();
        if self.reput_from_offset() < min_offset {
            warn!(
                "Dispatch offset {} is below the commit log minimum {min_offset}; skipping ahead",
                self.reput_from_offset()
            );
            self.set_reput_from_offset(min_offset);
        }

        let mut dispatched = 0usize;
        'segments: while self.reput_from_offset() < self.commit_log.get_max_offset() {
            let offset = self.reput_from_offset();
            let Some(buffer) = self.commit_log.get_data(offset) else {
                break;
            };
            let bytes = buffer.as_bytes();
            if bytes.is_empty() {
                break;
            }

            let mut pos = 0usize;
            while pos < bytes.len() {
                match check_message_and_return_size(&bytes[pos..], false) {
                    RecordScan::Record(request) => {
                        for dispatcher in &self.dispatchers {
                            dispatcher.dispatch(&request)?;
                        }
                        pos += request.msg_size as usize;
                        self.last_dispatched_timestamp
                            .store(request.store_timestamp, Ordering::Release);
                        self.set_reput_from_offset(offset + pos as u64);
                        dispatched += 1;
                    }
                    RecordScan::Blank { .. } => {
                        let next = self.commit_log.roll_next_file(offset + pos as u64);
                        debug!("Dispatch reached end of segment, rolling to {next}");
                        self.set_reput_from_offset(next);
                        continue 'segments;
                    }
                    RecordScan::End => break 'segments,
                    RecordScan::Corrupt { details } => {
                        return Err(StorageError::DataCorruption {
                            context: format!("commit log record at {}", offset + pos as u64),
                            details,
                        });
                    }
                }
            }
        }
        Ok(dispatched)
    }
}
