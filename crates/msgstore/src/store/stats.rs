use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::storage::file::common::now_millis;
use crate::store::service::ServiceThread;

/// Receives store activity; the store never reads it back.
pub trait StatsSink: Send + Sync {
    fn on_put(&self, success: bool, elapsed_ms: u64, size: usize);
    /// `transferred` is the number of messages returned.
    fn on_get(&self, found: bool, transferred: usize, elapsed_ms: u64);
    fn on_dispatch_behind(&self, bytes: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn on_put(&self, _success: bool, _elapsed_ms: u64, _size: usize) {}
    fn on_get(&self, _found: bool, _transferred: usize, _elapsed_ms: u64) {}
    fn on_dispatch_behind(&self, _bytes: u64) {}
}

/// Upper bounds (exclusive, ms) of the put latency buckets; the last bucket is open-ended.
const PUT_LATENCY_BOUNDS: [u64; 6] = [1, 10, 100, 500, 1_000, 10_000];
const PUT_LATENCY_LABELS: [&str; 7] = [
    "<=0ms", "0~10ms", "10~100ms", "100~500ms", "500ms~1s", "1~10s", "10s~",
];

/// Ten minutes of 1 s samples plus the starting point.
const MAX_SNAPSHOTS: usize = 601;
const SAMPLING_INTERVAL: Duration = Duration::from_secs(1);
const PRINT_TPS_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct CallSnapshot {
    timestamp: i64,
    put: u64,
    get_found: u64,
    get_miss: u64,
    get_transferred: u64,
}

/// Throughput over a window, in calls per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tps {
    pub put: f64,
    pub get_found: f64,
    pub get_miss: f64,
    pub get_transferred: f64,
}

fn per_second(begin: u64, end: u64, elapsed_ms: i64) -> f64 {
    if elapsed_ms <= 0 {
        return 0.0;
    }
    end.saturating_sub(begin) as f64 * 1_000.0 / elapsed_ms as f64
}

#[derive(Debug)]
pub struct StoreStatsService {
    boot_timestamp: i64,
    put_ok: AtomicU64,
    put_failed: AtomicU64,
    put_size_total: AtomicU64,
    put_latency: [AtomicU64; 7],
    put_max_ms: AtomicU64,
    get_found: AtomicU64,
    get_miss: AtomicU64,
    get_transferred: AtomicU64,
    get_max_ms: AtomicU64,
    dispatch_max_buffer: AtomicU64,
    snapshots: Mutex<VecDeque<CallSnapshot>>,
    last_print: AtomicI64,
    thread: ServiceThread,
}

impl Default for StoreStatsService {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreStatsService {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            boot_timestamp: now,
            put_ok: AtomicU64::new(0),
            put_failed: AtomicU64::new(0),
            put_size_total: AtomicU64::new(0),
            put_latency: Default::default(),
            put_max_ms: AtomicU64::new(0),
            get_found: AtomicU64::new(0),
            get_miss: AtomicU64::new(0),
            get_transferred: AtomicU64::new(0),
            get_max_ms: AtomicU64::new(0),
            dispatch_max_buffer: AtomicU64::new(0),
            snapshots: Mutex::new(VecDeque::with_capacity(MAX_SNAPSHOTS)),
            last_print: AtomicI64::new(now),
            thread: ServiceThread::new("StoreStatsService"),
        }
    }

    pub fn start(service: &Arc<Self>) -> Result<(), StorageError> {
        let this = Arc::clone(service);
        service.thread.start(move || this.run())
    }

    fn run(&self) {
        info!("{} service started", self.thread.name());
        while !self.thread.is_stopped() {
            self.thread.wait_for_running(SAMPLING_INTERVAL);
            let now = now_millis();
            self.sample_at(now);
            self.print_tps(now);
        }
        info!("{} service end", self.thread.name());
    }

    pub fn shutdown(&self) {
        self.thread.shutdown();
    }

    /// Record one sample of the cumulative counters at `timestamp`.
    pub fn sample_at(&self, timestamp: i64) {
        let snapshot = CallSnapshot {
            timestamp,
            put: self.put_ok.load(Ordering::Relaxed),
            get_found: self.get_found.load(Ordering::Relaxed),
            get_miss: self.get_miss.load(Ordering::Relaxed),
            get_transferred: self.get_transferred.load(Ordering::Relaxed),
        };
        let mut snapshots = self.snapshots.lock();
        snapshots.push_back(snapshot);
        while snapshots.len() > MAX_SNAPSHOTS {
            snapshots.pop_front();
        }
    }

    fn print_tps(&self, now: i64) {
        let last = self.last_print.load(Ordering::Relaxed);
        if now < last + PRINT_TPS_INTERVAL_MS {
            return;
        }
        self.last_print.store(now, Ordering::Relaxed);
        let tps = self.tps(60);
        info!("put_tps {:.2}", tps.put);
        info!("get_found_tps {:.2}", tps.get_found);
        info!("get_miss_tps {:.2}", tps.get_miss);
        info!("get_transfered_tps {:.2}", tps.get_transferred);
    }

    /// Throughput across the last `window_secs` samples (or as many as exist).
    pub fn tps(&self, window_secs: usize) -> Tps {
        let snapshots = self.snapshots.lock();
        let Some(last) = snapshots.back() else {
            return Tps::default();
        };
        let begin_index = snapshots.len().saturating_sub(window_secs + 1);
        let begin = &snapshots[begin_index];
        let elapsed = last.timestamp - begin.timestamp;
        Tps {
            put: per_second(begin.put, last.put, elapsed),
            get_found: per_second(begin.get_found, last.get_found, elapsed),
            get_miss: per_second(begin.get_miss, last.get_miss, elapsed),
            get_transferred: per_second(begin.get_transferred, last.get_transferred, elapsed),
        }
    }

    pub fn put_message_times_total(&self) -> u64 {
        self.put_ok.load(Ordering::Relaxed)
    }

    pub fn put_message_failed_times(&self) -> u64 {
        self.put_failed.load(Ordering::Relaxed)
    }

    pub fn get_message_found_total(&self) -> u64 {
        self.get_found.load(Ordering::Relaxed)
    }

    pub fn get_message_miss_total(&self) -> u64 {
        self.get_miss.load(Ordering::Relaxed)
    }

    pub fn put_latency_distribution(&self) -> [u64; 7] {
        std::array::from_fn(|i| self.put_latency[i].load(Ordering::Relaxed))
    }

    pub fn runtime_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        let now = now_millis();
        let put_total = self.put_ok.load(Ordering::Relaxed);
        let size_total = self.put_size_total.load(Ordering::Relaxed);
        let average_size = if put_total == 0 {
            0.0
        } else {
            size_total as f64 / put_total as f64
        };

        info.insert("bootTimestamp".to_string(), self.boot_timestamp.to_string());
        info.insert(
            "runtime".to_string(),
            format_runtime(now.saturating_sub(self.boot_timestamp)),
        );
        info.insert("putMessageTimesTotal".to_string(), put_total.to_string());
        info.insert(
            "putMessageFailedTimes".to_string(),
            self.put_failed.load(Ordering::Relaxed).to_string(),
        );
        info.insert("putMessageSizeTotal".to_string(), size_total.to_string());
        info.insert("putMessageAverageSize".to_string(), format!("{average_size:.2}"));
        info.insert(
            "putMessageEntireTimeMax".to_string(),
            self.put_max_ms.load(Ordering::Relaxed).to_string(),
        );
        info.insert(
            "getMessageEntireTimeMax".to_string(),
            self.get_max_ms.load(Ordering::Relaxed).to_string(),
        );
        info.insert(
            "dispatchMaxBuffer".to_string(),
            self.dispatch_max_buffer.load(Ordering::Relaxed).to_string(),
        );

        let distribution = self
            .put_latency_distribution()
            .iter()
            .zip(PUT_LATENCY_LABELS)
            .map(|(count, label)| format!("[{label}]:{count}"))
            .collect::<Vec<_>>()
            .join(" ");
        info.insert("putMessageDistributeTime".to_string(), distribution);

        for (name, window) in [("10s", 10), ("1m", 60), ("10m", 600)] {
            let tps = self.tps(window);
            info.insert(format!("putTps_{name}"), format!("{:.2}", tps.put));
            info.insert(format!("getFoundTps_{name}"), format!("{:.2}", tps.get_found));
            info.insert(format!("getMissTps_{name}"), format!("{:.2}", tps.get_miss));
            info.insert(
                format!("getTransferedTps_{name}"),
                format!("{:.2}", tps.get_transferred),
            );
        }
        info
    }
}

fn format_runtime(elapsed_ms: i64) -> String {
    let secs = elapsed_ms / 1_000;
    format!(
        "[ {} days, {} hours, {} minutes, {} seconds ]",
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60
    )
}

impl StatsSink for StoreStatsService {
    fn on_put(&self, success: bool, elapsed_ms: u64, size: usize) {
        if !success {
            self.put_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.put_ok.fetch_add(1, Ordering::Relaxed);
        self.put_size_total.fetch_add(size as u64, Ordering::Relaxed);
        let bucket = PUT_LATENCY_BOUNDS
            .iter()
            .position(|bound| elapsed_ms < *bound)
            .unwrap_or(PUT_LATENCY_BOUNDS.len());
        self.put_latency[bucket].fetch_add(1, Ordering::Relaxed);
        self.put_max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    fn on_get(&self, found: bool, transferred: usize, elapsed_ms: u64) {
        if found {
            self.get_found.fetch_add(1, Ordering::Relaxed);
            self.get_transferred
                .fetch_add(transferred as u64, Ordering::Relaxed);
        } else {
            self.get_miss.fetch_add(1, Ordering::Relaxed);
        }
        self.get_max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    fn on_dispatch_behind(&self, bytes: u64) {
        self.dispatch_max_buffer.fetch_max(bytes, Ordering::Relaxed);
    }
}
