use super::test_utilities::*;
use msgstore::storage::file::common::now_millis;
use test_log::test;

#[test]
fn test_query_by_key_returns_newest_first() {
    let config = TestConfig::new("bykey");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    let mut offsets = Vec::new();
    for i in 0..3 {
        let msg = test_message(topic, 0, &format!("order-{i}")).with_keys(["order", "other"]);
        offsets.push(store.put_message(&msg).append_result.unwrap().wrote_offset);
    }
    wait_for_dispatch(&store);

    let result = store.query_message(topic, "order", 10, 0, i64::MAX).unwrap();
    let found: Vec<u64> = result.messages.iter().map(|b| b.start_offset()).collect();
    offsets.reverse();
    assert_eq!(found, offsets);
    assert!(result.index_last_update_phy_offset >= offsets[0]);

    let limited = store.query_message(topic, "other", 2, 0, i64::MAX).unwrap();
    assert_eq!(limited.messages.len(), 2);

    let other_topic = store.query_message("SomeOtherTopic", "order", 10, 0, i64::MAX).unwrap();
    assert!(other_topic.messages.is_empty());
}

#[test]
fn test_query_respects_time_window() {
    let config = TestConfig::new("window");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    let before = now_millis();
    let appended = store
        .put_message(&test_message(topic, 0, "timed").with_keys(["when"]))
        .append_result
        .unwrap();
    wait_for_dispatch(&store);

    let inside = store
        .query_message(topic, "when", 10, before - 1000, now_millis() + 1000)
        .unwrap();
    assert_eq!(inside.messages.len(), 1);
    assert_eq!(inside.messages[0].start_offset(), appended.wrote_offset);

    let later = store
        .query_message(topic, "when", 10, appended.store_timestamp + 60_000, i64::MAX)
        .unwrap();
    assert!(later.messages.is_empty());

    let earlier = store
        .query_message(topic, "when", 10, 0, before - 60_000)
        .unwrap();
    assert!(earlier.messages.is_empty());
}

#[test]
fn test_hash_collisions_are_filtered() {
    let config = TestConfig::new("collide");
    let mut store_config = config.store_config();
    store_config.max_hash_slot_num = 1;
    let store = open_store(store_config);
    let topic = &config.topic_name;

    for i in 0..20 {
        let msg = test_message(topic, 0, &format!("v{i}")).with_keys([format!("key{i}")]);
        assert!(store.put_message(&msg).is_ok());
    }
    wait_for_dispatch(&store);

    for i in 0..20 {
        let result = store
            .query_message(topic, &format!("key{i}"), 32, 0, i64::MAX)
            .unwrap();
        assert_eq!(result.messages.len(), 1, "key{i}");
        assert_eq!(
            decode(&result.messages[0]).message.body,
            format!("v{i}").into_bytes()
        );
    }
}

#[test]
fn test_index_rolls_when_full() {
    let config = TestConfig::new("indexroll");
    let mut store_config = config.store_config();
    store_config.max_index_num = 8;
    let store = open_store(store_config);
    let topic = &config.topic_name;

    for i in 0..30 {
        let msg = test_message(topic, 0, &format!("v{i}")).with_keys([format!("roll{i}")]);
        assert!(store.put_message(&msg).is_ok());
    }
    wait_for_dispatch(&store);

    // Seven usable entries per file.
    let files: usize = store.runtime_info()["indexFileCount"].parse().unwrap();
    assert_eq!(files, 5);

    for i in [0, 6, 7, 29] {
        let result = store
            .query_message(topic, &format!("roll{i}"), 32, 0, i64::MAX)
            .unwrap();
        assert_eq!(result.messages.len(), 1, "roll{i}");
    }
}

#[test]
fn test_disabled_index_answers_nothing() {
    let config = TestConfig::new("noindex");
    let mut store_config = config.store_config();
    store_config.message_index_enable = false;
    let index_dir = store_config.index_dir();
    let store = open_store(store_config);
    let topic = &config.topic_name;

    assert!(
        store
            .put_message(&test_message(topic, 0, "x").with_keys(["k"]))
            .is_ok()
    );
    wait_for_dispatch(&store);

    let result = store.query_message(topic, "k", 10, 0, i64::MAX).unwrap();
    assert!(result.messages.is_empty());
    assert!(!index_dir.exists() || std::fs::read_dir(&index_dir).unwrap().next().is_none());
    assert_eq!(store.get_max_offset_in_queue(topic, 0), 1);
}

#[test]
fn test_index_survives_restart() {
    let config = TestConfig::new("indexrestart");
    let topic = config.topic_name.clone();

    {
        let store = open_store(config.store_config());
        for i in 0..5 {
            let msg = test_message(&topic, 0, &format!("v{i}")).with_keys([format!("persist{i}")]);
            assert!(store.put_message(&msg).is_ok());
        }
        wait_for_dispatch(&store);
    }

    let store = open_store(config.store_config());
    let result = store.query_message(&topic, "persist3", 10, 0, i64::MAX).unwrap();
    assert_eq!(result.messages.len(), 1);

    // The restart appends to the existing index file.
    let msg = test_message(&topic, 0, "v5").with_keys(["persist5"]);
    assert!(store.put_message(&msg).is_ok());
    wait_for_dispatch(&store);
    assert_eq!(store.runtime_info()["indexFileCount"], "1");
    for key in ["persist0", "persist5"] {
        let result = store.query_message(&topic, key, 10, 0, i64::MAX).unwrap();
        assert_eq!(result.messages.len(), 1, "{key}");
    }
}
