use super::test_utilities::*;
use msgstore::message::MESSAGE_MAGIC_CODE;
use msgstore::storage::file::common::offset_to_file_name;
use msgstore::store::checkpoint::StoreCheckpoint;
use msgstore::store::consume_queue::{CQ_STORE_UNIT_SIZE, CqEntry};
use msgstore::{DefaultMessageStore, GetMessageStatus, StoreState};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use test_log::test;

fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// Header of a record that claims 200 bytes but whose content says otherwise.
fn torn_record_header() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&200u32.to_be_bytes());
    bytes.extend_from_slice(&MESSAGE_MAGIC_CODE.to_be_bytes());
    bytes.extend_from_slice(&[0xAB; 32]);
    bytes
}

#[test]
fn test_clean_restart_keeps_everything() {
    let config = TestConfig::new("restart");
    let topic = config.topic_name.clone();

    let max_phy = {
        let store = open_store(config.store_config());
        for i in 0..20 {
            let msg = test_message(&topic, i % 2, &format!("m{i}")).with_keys([format!("k{i}")]);
            assert!(store.put_message(&msg).is_ok());
        }
        wait_for_dispatch(&store);
        let max_phy = store.get_max_phy_offset();
        store.shutdown();
        assert!(!store.config().abort_path().exists());
        max_phy
    };

    let store = open_store(config.store_config());
    assert_eq!(store.get_max_phy_offset(), max_phy);
    assert_eq!(store.get_max_offset_in_queue(&topic, 0), 10);
    assert_eq!(store.get_max_offset_in_queue(&topic, 1), 10);

    let result = store.get_message(&topic, 1, 0, 32, None).unwrap();
    assert_eq!(result.message_count(), 10);
    assert_eq!(decode(&result.messages[0]).message.body, b"m1");

    let hits = store.query_message(&topic, "k7", 10, 0, i64::MAX).unwrap();
    assert_eq!(hits.messages.len(), 1);
    assert_eq!(decode(&hits.messages[0]).message.body, b"m7");
}

#[test]
fn test_abnormal_restart_truncates_torn_tail() {
    let config = TestConfig::new("torn");
    let topic = config.topic_name.clone();
    let store_config = config.store_config();

    let max_phy = {
        let store = open_store(store_config.clone());
        for i in 0..5 {
            assert!(store.put_message(&test_message(&topic, 0, &format!("m{i}"))).is_ok());
        }
        wait_for_dispatch(&store);
        let max_phy = store.get_max_phy_offset();
        store.shutdown();
        max_phy
    };

    // Simulate a crash mid-append: a partial record after the last good one, a consume
    // queue entry pointing at it, and no clean-shutdown marker.
    let segment = store_config.commit_log_dir().join(offset_to_file_name(0));
    write_at(&segment, max_phy, &torn_record_header());
    let cq_segment = store_config
        .consume_queue_dir()
        .join(&topic)
        .join("0")
        .join(offset_to_file_name(0));
    let dangling = CqEntry {
        commit_log_offset: max_phy,
        size: 200,
        tags_code: 0,
    };
    write_at(&cq_segment, (5 * CQ_STORE_UNIT_SIZE) as u64, &dangling.encode());
    std::fs::write(store_config.abort_path(), b"").unwrap();

    let store = open_store(store_config);
    assert_eq!(store.get_max_phy_offset(), max_phy);
    assert_eq!(store.get_max_offset_in_queue(&topic, 0), 5);

    let result = store.put_message(&test_message(&topic, 0, "after-crash"));
    let appended = result.append_result.unwrap();
    assert_eq!(appended.wrote_offset, max_phy);
    assert_eq!(appended.logics_offset, 5);

    wait_for_dispatch(&store);
    let result = store.get_message(&topic, 0, 0, 32, None).unwrap();
    assert_eq!(result.status, GetMessageStatus::Found);
    let bodies: Vec<Vec<u8>> = result
        .messages
        .iter()
        .map(|b| decode(b).message.body)
        .collect();
    assert_eq!(bodies.len(), 6);
    assert_eq!(bodies[5], b"after-crash");
}

#[test]
fn test_abnormal_restart_rebuilds_missing_consume_queue() {
    let config = TestConfig::new("rebuild");
    let topic = config.topic_name.clone();
    let store_config = config.store_config();

    {
        let store = open_store(store_config.clone());
        for i in 0..8 {
            assert!(store.put_message(&test_message(&topic, 0, &format!("m{i}"))).is_ok());
        }
        wait_for_dispatch(&store);
        store.shutdown();
    }

    std::fs::remove_dir_all(store_config.consume_queue_dir()).unwrap();
    std::fs::remove_file(store_config.checkpoint_path()).unwrap();
    std::fs::write(store_config.abort_path(), b"").unwrap();

    let store = open_store(store_config);
    assert_eq!(store.get_max_offset_in_queue(&topic, 0), 8);
    let result = store.get_message(&topic, 0, 0, 32, None).unwrap();
    assert_eq!(result.message_count(), 8);
}

#[test]
fn test_refuses_to_load_when_recovery_discards_too_much() {
    let config = TestConfig::new("refuse");
    let topic = config.topic_name.clone();
    let store_config = config.store_config();

    let max_phy = {
        let store = open_store(store_config.clone());
        for i in 0..3 {
            assert!(store.put_message(&test_message(&topic, 0, &format!("m{i}"))).is_ok());
        }
        let max_phy = store.get_max_phy_offset();
        store.shutdown();
        max_phy
    };

    // The checkpoint claims far more durable data than the log holds.
    let checkpoint = StoreCheckpoint::load(store_config.checkpoint_path()).unwrap();
    checkpoint.set_physic_flushed(max_phy + 16 * 1024 * 1024, 0);
    checkpoint.flush().unwrap();
    std::fs::write(store_config.abort_path(), b"").unwrap();

    let store = DefaultMessageStore::new(store_config.clone()).unwrap();
    assert!(!store.load().unwrap());
    assert_eq!(store.state(), StoreState::Created);
    assert!(store.start().is_err());
    drop(store);

    // Nothing was discarded, so dropping the bad checkpoint lets the store come back whole.
    std::fs::remove_file(store_config.checkpoint_path()).unwrap();
    let store = open_store(store_config);
    assert_eq!(store.get_max_phy_offset(), max_phy);
    assert_eq!(store.get_max_offset_in_queue(&topic, 0), 3);
}

#[test]
fn test_reads_skip_removed_head_segment() {
    let config = TestConfig::new("headgone");
    let topic = config.topic_name.clone();
    let mut store_config = config.store_config();
    store_config.mapped_file_size_commit_log = 4096;
    store_config.max_message_size = 1024;

    {
        let store = open_store(store_config.clone());
        let body = "b".repeat(100);
        for _ in 0..80 {
            assert!(store.put_message(&test_message(&topic, 0, &body)).is_ok());
        }
        wait_for_dispatch(&store);
        store.shutdown();
    }
    std::fs::remove_file(store_config.commit_log_dir().join(offset_to_file_name(0))).unwrap();

    let store = open_store(store_config);
    let min_phy = store.get_min_phy_offset();
    assert_eq!(min_phy, 4096);
    assert!(store.look_message_by_offset(0).is_none());

    let result = store.get_message(&topic, 0, 0, 4, None).unwrap();
    assert_eq!(result.status, GetMessageStatus::Found);
    assert!(result.messages.iter().all(|b| b.start_offset() >= min_phy));
    assert!(result.next_begin_offset > 4);
}
