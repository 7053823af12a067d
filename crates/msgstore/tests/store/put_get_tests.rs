use super::test_utilities::*;
use msgstore::message::MAX_TOPIC_LENGTH;
use msgstore::{GetMessageStatus, Message, PutMessageStatus, TagFilter};
use test_log::test;

#[test]
fn test_put_then_get_in_order() {
    let config = TestConfig::new("putget");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    for i in 0..10 {
        let result = store.put_message(&test_message(topic, 0, &format!("message-{i}")));
        assert_eq!(result.status, PutMessageStatus::PutOk);
        assert_eq!(result.append_result.unwrap().logics_offset, i);
    }
    wait_for_dispatch(&store);

    let result = store.get_message(topic, 0, 0, 32, None).unwrap();
    assert_eq!(result.status, GetMessageStatus::Found);
    assert_eq!(result.message_count(), 10);
    assert_eq!(result.next_begin_offset, 10);
    for (i, buffer) in result.messages.iter().enumerate() {
        let ext = decode(buffer);
        assert_eq!(ext.queue_offset, i as u64);
        assert_eq!(ext.message.topic, *topic);
        assert_eq!(ext.message.body, format!("message-{i}").into_bytes());
    }
}

#[test]
fn test_queues_are_independent() {
    let config = TestConfig::new("queues");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    for i in 0..6u32 {
        assert!(store.put_message(&test_message(topic, i % 3, "x")).is_ok());
    }
    wait_for_dispatch(&store);

    for queue_id in 0..3 {
        assert_eq!(store.get_max_offset_in_queue(topic, queue_id), 2);
        assert_eq!(store.get_min_offset_in_queue(topic, queue_id), 0);
    }
    assert_eq!(store.get_max_offset_in_queue(topic, 3), 0);
}

#[test]
fn test_offset_statuses() {
    let config = TestConfig::new("statuses");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    let result = store.get_message(topic, 0, 0, 1, None).unwrap();
    assert_eq!(result.status, GetMessageStatus::NoMatchedLogicQueue);

    assert!(store.put_message(&test_message(topic, 0, "only")).is_ok());
    wait_for_dispatch(&store);

    let at_max = store.get_message(topic, 0, 1, 1, None).unwrap();
    assert_eq!(at_max.status, GetMessageStatus::OffsetNotYetAvailable);
    assert_eq!(at_max.next_begin_offset, 1);

    let beyond = store.get_message(topic, 0, 100, 1, None).unwrap();
    assert_eq!(beyond.status, GetMessageStatus::OffsetNotYetAvailable);
    assert_eq!(beyond.next_begin_offset, 1);
    assert_eq!(beyond.max_offset, 1);
}

#[test]
fn test_transfer_limits() {
    let config = TestConfig::new("limits");
    let mut store_config = config.store_config();
    store_config.max_transfer_count_on_message = 4;
    store_config.max_transfer_bytes_on_message = 1024;
    let store = open_store(store_config);
    let topic = &config.topic_name;

    let body = "b".repeat(200);
    for _ in 0..10 {
        assert!(store.put_message(&test_message(topic, 0, &body)).is_ok());
    }
    wait_for_dispatch(&store);

    // Each record is just under 300 bytes, so only three fit in 1 KiB.
    let result = store.get_message(topic, 0, 0, 32, None).unwrap();
    assert_eq!(result.message_count(), 3);
    assert!(result.buffer_total_size <= 1024);
    assert_eq!(result.next_begin_offset, 3);

    let mut count_limited = config.store_config();
    count_limited.max_transfer_count_on_message = 4;
    drop(store);
    let store = open_store(count_limited);
    let result = store.get_message(topic, 0, 0, 32, None).unwrap();
    assert_eq!(result.message_count(), 4);
}

#[test]
fn test_tag_filter_skips_unmatched_entries() {
    let config = TestConfig::new("tags");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    for i in 0..9 {
        let tag = ["TagA", "TagB", "TagC"][i % 3];
        let msg = test_message(topic, 0, &format!("m{i}")).with_tags(tag);
        assert!(store.put_message(&msg).is_ok());
    }
    wait_for_dispatch(&store);

    let filter = TagFilter::parse("TagA || TagC");
    let result = store.get_message(topic, 0, 0, 32, Some(&filter)).unwrap();
    assert_eq!(result.status, GetMessageStatus::Found);
    let tags: Vec<String> = result
        .messages
        .iter()
        .map(|b| decode(b).message.tags().unwrap().to_string())
        .collect();
    assert_eq!(tags, ["TagA", "TagC", "TagA", "TagC", "TagA", "TagC"]);
    assert_eq!(result.next_begin_offset, 9);
}

#[test]
fn test_invalid_messages_are_rejected() {
    let config = TestConfig::new("invalid");
    let store = open_store(config.store_config());

    let long_topic = "t".repeat(MAX_TOPIC_LENGTH + 1);
    let result = store.put_message(&Message::new(long_topic, 0, "x"));
    assert_eq!(result.status, PutMessageStatus::MessageIllegal);
    assert!(result.append_result.is_none());

    let bad_chars = store.put_message(&Message::new("bad topic!", 0, "x"));
    assert_eq!(bad_chars.status, PutMessageStatus::MessageIllegal);

    let too_big = store.put_message(&test_message(&config.topic_name, 0, &"x".repeat(8192)));
    assert_eq!(too_big.status, PutMessageStatus::MessageIllegal);

    let huge_property = Message::new(config.topic_name.clone(), 0, "x")
        .with_property("big", "p".repeat(40_000));
    assert_eq!(
        store.put_message(&huge_property).status,
        PutMessageStatus::PropertiesSizeExceeded
    );

    assert_eq!(store.get_max_phy_offset(), 0);
}

#[test]
fn test_consume_queue_rolls_across_segments() {
    let config = TestConfig::new("cqroll");
    let store = open_store(config.store_config());
    let topic = &config.topic_name;

    // Consume queue segments hold 100 entries.
    for i in 0..250 {
        assert!(store.put_message(&test_message(topic, 0, &format!("{i}"))).is_ok());
    }
    wait_for_dispatch(&store);
    assert_eq!(store.get_max_offset_in_queue(topic, 0), 250);

    let mut offset = 0;
    let mut seen = 0;
    while offset < 250 {
        let result = store.get_message(topic, 0, offset, 32, None).unwrap();
        assert_eq!(result.status, GetMessageStatus::Found);
        for buffer in &result.messages {
            assert_eq!(decode(buffer).message.body, seen.to_string().into_bytes());
            seen += 1;
        }
        offset = result.next_begin_offset;
    }
    assert_eq!(seen, 250);
}
