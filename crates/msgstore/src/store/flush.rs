//! Background flushing of the commit log and the derived queues.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::{FlushDiskType, StoreConfig};
use crate::error::StorageError;
use crate::storage::file::MappedFileQueue;
use crate::storage::file::common::now_millis;
use crate::store::checkpoint::StoreCheckpoint;
use crate::store::consume_queue::ConsumeQueueTable;
use crate::store::dispatch::ReputMessageService;
use crate::store::index_service::IndexService;
use crate::store::service::ServiceThread;

const RETRY_TIMES_OVER: usize = 10;

struct GroupCommitRequest {
    next_offset: u64,
    deadline: Instant,
    completion: SyncSender<bool>,
}

/// Batches synchronous flush requests: one disk flush per round resolves every waiter whose
/// offset became durable.
pub struct GroupCommitService {
    queue: Arc<MappedFileQueue>,
    checkpoint: Arc<StoreCheckpoint>,
    requests: Mutex<Vec<GroupCommitRequest>>,
    poll_interval: Duration,
    timeout: Duration,
    thread: ServiceThread,
}

impl GroupCommitService {
    pub fn new(
        queue: Arc<MappedFileQueue>,
        checkpoint: Arc<StoreCheckpoint>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            checkpoint,
            requests: Mutex::new(Vec::new()),
            poll_interval,
            timeout,
            thread: ServiceThread::new("GroupCommitService"),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(service: &Arc<Self>) -> Result<(), StorageError> {
        let this = Arc::clone(service);
        service.thread.start(move || this.run())
    }

    /// Queue a request for durability up to `next_offset`; the receiver yields `true` once a
    /// flush covers it, `false` if the deadline passes first.
    pub fn put_request(&self, next_offset: u64) -> Receiver<bool> {
        let (completion, receiver) = mpsc::sync_channel(1);
        self.requests.lock().push(GroupCommitRequest {
            next_offset,
            deadline: Instant::now() + self.timeout,
            completion,
        });
        self.thread.wakeup();
        receiver
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    fn do_commit(&self, final_round: bool) {
        let requests = std::mem::take(&mut *self.requests.lock());

        let flushed = match self.queue.flush(0) {
            Ok(flushed) => flushed,
            Err(e) => {
                warn!("Group commit flush failed: {e}");
                self.queue.flushed_where()
            }
        };
        if flushed > 0 {
            self.checkpoint.set_physic_flushed(flushed, now_millis());
        }

        let now = Instant::now();
        let mut retry = Vec::new();
        for request in requests {
            if flushed >= request.next_offset {
                let _ = request.completion.send(true);
            } else if final_round || now >= request.deadline {
                let _ = request.completion.send(false);
            } else {
                retry.push(request);
            }
        }
        if !retry.is_empty() {
            debug!("{} group commit requests carried to next round", retry.len());
            self.requests.lock().extend(retry);
        }
    }

    fn run(&self) {
        info!("{} service started", self.thread.name());
        while !self.thread.is_stopped() {
            self.thread.wait_for_running(self.poll_interval);
            self.do_commit(false);
        }

        // Requests that raced with the stop flag still get a flush.
        std::thread::sleep(Duration::from_millis(10));
        self.do_commit(true);
        info!("{} service end", self.thread.name());
    }

    pub fn shutdown(&self) {
        self.thread.shutdown();
        // Never leave a waiter hanging if the thread was not running.
        self.do_commit(true);
    }
}

/// Periodic flush for asynchronous mode.
pub struct FlushRealTimeService {
    queue: Arc<MappedFileQueue>,
    checkpoint: Arc<StoreCheckpoint>,
    interval: Duration,
    least_pages: usize,
    thorough_interval: Duration,
    thread: ServiceThread,
}

impl FlushRealTimeService {
    pub fn new(
        queue: Arc<MappedFileQueue>,
        checkpoint: Arc<StoreCheckpoint>,
        interval: Duration,
        least_pages: usize,
        thorough_interval: Duration,
    ) -> Self {
        Self {
            queue,
            checkpoint,
            interval,
            least_pages,
            thorough_interval,
            thread: ServiceThread::new("FlushRealTimeService"),
        }
    }

    pub fn start(service: &Arc<Self>) -> Result<(), StorageError> {
        let this = Arc::clone(service);
        service.thread.start(move || this.run())
    }

    pub fn wakeup(&self) {
        self.thread.wakeup();
    }

    fn flush(&self, least_pages: usize) -> Result<(), StorageError> {
        let flushed = self.queue.flush(least_pages)?;
        if flushed > 0 {
            self.checkpoint.set_physic_flushed(flushed, now_millis());
        }
        Ok(())
    }

    fn run(&self) {
        info!("{} service started", self.thread.name());
        let mut last_thorough = Instant::now();

        while !self.thread.is_stopped() {
            let woken = self.thread.wait_for_running(self.interval);

            // A wakeup only flushes once enough pages are dirty; a timer tick or an overdue
            // thorough flush writes everything.
            let mut least_pages = if woken { self.least_pages } else { 0 };
            if last_thorough.elapsed() >= self.thorough_interval {
                last_thorough = Instant::now();
                least_pages = 0;
            }

            if let Err(e) = self.flush(least_pages) {
                warn!("{} flush failed: {e}", self.thread.name());
            }
        }

        for attempt in 0..RETRY_TIMES_OVER {
            match self.flush(0) {
                Ok(()) if self.queue.how_much_fall_behind() == 0 => break,
                Ok(()) => {}
                Err(e) => warn!("Final flush attempt {attempt} failed: {e}"),
            }
        }
        info!("{} service end", self.thread.name());
    }

    pub fn shutdown(&self) {
        self.thread.shutdown();
    }
}

/// The commit log flush policy, fixed at construction.
#[derive(Clone)]
pub enum FlushService {
    Sync(Arc<GroupCommitService>),
    Async(Arc<FlushRealTimeService>),
}

impl FlushService {
    pub fn new(
        config: &StoreConfig,
        queue: Arc<MappedFileQueue>,
        checkpoint: Arc<StoreCheckpoint>,
    ) -> Self {
        match config.flush_disk_type {
            FlushDiskType::Sync { timeout_ms } => {
                FlushService::Sync(Arc::new(GroupCommitService::new(
                    queue,
                    checkpoint,
                    config.group_commit_poll_interval(),
                    Duration::from_millis(timeout_ms),
                )))
            }
            FlushDiskType::Async { interval_ms } => {
                FlushService::Async(Arc::new(FlushRealTimeService::new(
                    queue,
                    checkpoint,
                    Duration::from_millis(interval_ms),
                    config.flush_commit_log_least_pages,
                    Duration::from_millis(config.flush_commit_log_thorough_interval_ms),
                )))
            }
        }
    }

    pub fn start(&self) -> Result<(), StorageError> {
        match self {
            FlushService::Sync(service) => GroupCommitService::start(service),
            FlushService::Async(service) => FlushRealTimeService::start(service),
        }
    }

    pub fn shutdown(&self) {
        match self {
            FlushService::Sync(service) => service.shutdown(),
            FlushService::Async(service) => service.shutdown(),
        }
    }
}

/// Flushes consume queues and index files, then advances the checkpoint's dispatched offset.
pub struct FlushConsumeQueueService {
    consume_queues: Arc<ConsumeQueueTable>,
    index_service: Arc<IndexService>,
    reput: Arc<ReputMessageService>,
    checkpoint: Arc<StoreCheckpoint>,
    interval: Duration,
    thread: ServiceThread,
}

impl FlushConsumeQueueService {
    pub fn new(
        consume_queues: Arc<ConsumeQueueTable>,
        index_service: Arc<IndexService>,
        reput: Arc<ReputMessageService>,
        checkpoint: Arc<StoreCheckpoint>,
        interval: Duration,
    ) -> Self {
        Self {
            consume_queues,
            index_service,
            reput,
            checkpoint,
            interval,
            thread: ServiceThread::new("FlushConsumeQueueService"),
        }
    }

    pub fn start(service: &Arc<Self>) -> Result<(), StorageError> {
        let this = Arc::clone(service);
        service.thread.start(move || this.run())
    }

    /// Everything dispatched before this call is durable once it returns `Ok`.
    pub fn do_flush(&self) -> Result<(), StorageError> {
        let dispatched = self.reput.reput_from_offset();
        let timestamp = self.reput.last_dispatched_timestamp();

        self.consume_queues.flush()?;
        self.index_service.flush()?;

        self.checkpoint.set_dispatched(dispatched, timestamp);
        self.checkpoint.flush()
    }

    fn run(&self) {
        info!("{} service started", self.thread.name());
        while !self.thread.is_stopped() {
            self.thread.wait_for_running(self.interval);
            if let Err(e) = self.do_flush() {
                warn!("{} flush failed: {e}", self.thread.name());
            }
        }
        if let Err(e) = self.do_flush() {
            warn!("{} final flush failed: {e}", self.thread.name());
        }
        info!("{} service end", self.thread.name());
    }

    pub fn shutdown(&self) {
        self.thread.shutdown();
    }
}
