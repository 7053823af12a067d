use super::test_utilities::*;
use msgstore::store::checkpoint::StoreCheckpoint;
use msgstore::{DefaultMessageStore, FlushDiskType, PutMessageStatus};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use test_log::test;

fn flushed_offset(store: &DefaultMessageStore) -> u64 {
    store.runtime_info()["commitLogFlushedOffset"]
        .parse()
        .expect("numeric flushed offset")
}

#[test]
fn test_sync_put_returns_after_flush() {
    let config = TestConfig::new("syncflush");
    let mut store_config = config.store_config();
    store_config.flush_disk_type = FlushDiskType::sync_default();
    let store = open_store(store_config);

    for i in 0..10 {
        let result = store.put_message(&test_message(&config.topic_name, 0, &format!("s{i}")));
        assert_eq!(result.status, PutMessageStatus::PutOk);
        let appended = result.append_result.unwrap();
        assert!(flushed_offset(&store) >= appended.wrote_offset + appended.wrote_bytes as u64);
    }
}

#[test]
fn test_group_commit_serves_concurrent_producers() {
    let config = TestConfig::new("groupcommit");
    let mut store_config = config.store_config();
    store_config.flush_disk_type = FlushDiskType::sync_default();
    let store = Arc::new(open_store(store_config));

    let handles: Vec<_> = (0..8)
        .map(|producer| {
            let store = Arc::clone(&store);
            let topic = config.topic_name.clone();
            thread::spawn(move || {
                (0..20)
                    .map(|i| {
                        store
                            .put_message(&test_message(&topic, producer, &format!("{i}")))
                            .status
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        let statuses = handle.join().expect("producer panicked");
        assert!(statuses.iter().all(|s| *s == PutMessageStatus::PutOk), "{statuses:?}");
    }
    assert_eq!(flushed_offset(&store), store.get_max_phy_offset());
}

#[test]
fn test_async_flush_catches_up() {
    let config = TestConfig::new("asyncflush");
    let mut store_config = config.store_config();
    store_config.flush_disk_type = FlushDiskType::Async { interval_ms: 5 };
    store_config.flush_commit_log_least_pages = 0;
    let store = open_store(store_config);

    for i in 0..50 {
        let result = store.put_message(&test_message(&config.topic_name, 0, &format!("a{i}")));
        assert_eq!(result.status, PutMessageStatus::PutOk);
    }
    let target = store.get_max_phy_offset();

    let deadline = Instant::now() + Duration::from_secs(10);
    while flushed_offset(&store) < target {
        assert!(Instant::now() < deadline, "async flush did not catch up");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_shutdown_persists_checkpoint() {
    let config = TestConfig::new("checkpoint");
    let store_config = config.store_config();
    let store = open_store(store_config.clone());

    for i in 0..12 {
        assert!(store.put_message(&test_message(&config.topic_name, 0, &format!("c{i}"))).is_ok());
    }
    wait_for_dispatch(&store);
    let max_phy = store.get_max_phy_offset();
    store.shutdown();

    let checkpoint = StoreCheckpoint::load(store_config.checkpoint_path()).unwrap();
    assert!(checkpoint.existed());
    let state = checkpoint.snapshot();
    assert_eq!(state.physic_flushed_offset, max_phy);
    assert_eq!(state.dispatched_offset, max_phy);
    assert!(state.index_msg_timestamp > 0);
}
