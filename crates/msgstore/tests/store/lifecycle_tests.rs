use super::test_utilities::*;
use msgstore::store::stats::StatsSink;
use msgstore::{DefaultMessageStore, ErrorKind, PutMessageStatus, StoreState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use test_log::test;

#[test]
fn test_second_store_on_same_directory_is_rejected() {
    let config = TestConfig::new("dirlock");
    let _first = open_store(config.store_config());

    let second = DefaultMessageStore::new(config.store_config()).unwrap();
    let error = second.load().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Unavailable);
    assert_eq!(second.state(), StoreState::Created);
}

#[test]
fn test_directory_is_reusable_after_shutdown() {
    let config = TestConfig::new("reuse");
    let first = open_store(config.store_config());
    first.shutdown();
    assert_eq!(first.state(), StoreState::Shutdown);

    let second = open_store(config.store_config());
    assert_eq!(second.state(), StoreState::Running);
}

#[test]
fn test_destroy_then_fresh_load() {
    let config = TestConfig::new("destroy");
    let store_config = config.store_config();
    let store = open_store(store_config.clone());
    for i in 0..5 {
        assert!(store.put_message(&test_message(&config.topic_name, 0, &format!("{i}"))).is_ok());
    }

    store.destroy().unwrap();
    assert_eq!(store.state(), StoreState::Created);
    assert!(!store_config.commit_log_dir().exists());
    assert!(!store_config.consume_queue_dir().exists());
    assert!(!store_config.checkpoint_path().exists());

    assert!(store.load().unwrap());
    store.start().unwrap();
    assert_eq!(store.get_min_phy_offset(), 0);
    assert_eq!(store.get_max_phy_offset(), 0);
    assert_eq!(store.get_max_offset_in_queue(&config.topic_name, 0), 0);
    let result = store.put_message(&test_message(&config.topic_name, 0, "fresh"));
    assert_eq!(result.append_result.unwrap().wrote_offset, 0);
}

#[test]
fn test_queue_offsets_continue_after_restart() {
    let config = TestConfig::new("continue");
    let topic = config.topic_name.clone();

    {
        let store = open_store(config.store_config());
        for _ in 0..4 {
            assert!(store.put_message(&test_message(&topic, 2, "before")).is_ok());
        }
    }

    let store = open_store(config.store_config());
    let result = store.put_message(&test_message(&topic, 2, "after"));
    assert_eq!(result.append_result.unwrap().logics_offset, 4);
    let other = store.put_message(&test_message(&topic, 3, "new queue"));
    assert_eq!(other.append_result.unwrap().logics_offset, 0);
}

#[test]
fn test_requests_rejected_unless_running() {
    let config = TestConfig::new("notrunning");
    let store = DefaultMessageStore::new(config.store_config()).unwrap();
    let msg = test_message(&config.topic_name, 0, "x");

    assert_eq!(store.put_message(&msg).status, PutMessageStatus::ServiceNotAvailable);
    assert!(store.load().unwrap());
    assert_eq!(store.put_message(&msg).status, PutMessageStatus::ServiceNotAvailable);
    assert!(store.get_message(&config.topic_name, 0, 0, 1, None).is_err());

    store.start().unwrap();
    assert!(store.put_message(&msg).is_ok());
    store.shutdown();
    assert_eq!(store.put_message(&msg).status, PutMessageStatus::ServiceNotAvailable);
    assert!(store.get_message(&config.topic_name, 0, 0, 1, None).is_err());
}

#[test]
fn test_runtime_info_reports_activity() {
    let config = TestConfig::new("runtime");
    let store = open_store(config.store_config());
    for i in 0..7 {
        assert!(store.put_message(&test_message(&config.topic_name, 0, &format!("{i}"))).is_ok());
    }
    wait_for_dispatch(&store);
    let _ = store.get_message(&config.topic_name, 0, 0, 32, None).unwrap();
    let _ = store.get_message(&config.topic_name, 0, 7, 32, None).unwrap();

    let stats = store.stats_service().expect("built-in stats");
    assert_eq!(stats.put_message_times_total(), 7);
    assert_eq!(stats.get_message_found_total(), 1);
    assert_eq!(stats.get_message_miss_total(), 1);
    assert_eq!(stats.put_latency_distribution().iter().sum::<u64>(), 7);

    let info = store.runtime_info();
    assert_eq!(info["storeState"], "Running");
    assert_eq!(info["putMessageTimesTotal"], "7");
    assert_eq!(info["dispatchBehindBytes"], "0");
    assert_eq!(info["consumeQueueCount"], "1");
    assert_eq!(info["commitLogMaxOffset"], store.get_max_phy_offset().to_string());
    assert!(info.contains_key("putTps_10s"));
}

#[derive(Default)]
struct CountingSink {
    puts: AtomicU64,
    bytes: AtomicU64,
    gets: AtomicU64,
    transferred: AtomicU64,
}

impl StatsSink for CountingSink {
    fn on_put(&self, success: bool, _elapsed_ms: u64, size: usize) {
        if success {
            self.puts.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    fn on_get(&self, _found: bool, transferred: usize, _elapsed_ms: u64) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.transferred
            .fetch_add(transferred as u64, Ordering::Relaxed);
    }

    fn on_dispatch_behind(&self, _bytes: u64) {}
}

#[test]
fn test_custom_stats_sink_receives_events() {
    let config = TestConfig::new("sink");
    let sink = Arc::new(CountingSink::default());
    let store =
        DefaultMessageStore::with_stats_sink(config.store_config(), sink.clone()).unwrap();
    assert!(store.load().unwrap());
    store.start().unwrap();
    assert!(store.stats_service().is_none());

    for _ in 0..3 {
        assert!(store.put_message(&test_message(&config.topic_name, 0, "abc")).is_ok());
    }
    wait_for_dispatch(&store);
    let _ = store.get_message(&config.topic_name, 0, 0, 32, None).unwrap();

    assert_eq!(sink.puts.load(Ordering::Relaxed), 3);
    assert_eq!(sink.bytes.load(Ordering::Relaxed), store.get_max_phy_offset());
    assert_eq!(sink.gets.load(Ordering::Relaxed), 1);
    assert_eq!(sink.transferred.load(Ordering::Relaxed), 3);
}
