use super::test_utilities::*;
use msgstore::storage::file::common::list_segment_files;
use msgstore::store::index_file::IndexFile;
use msgstore::{FlushDiskType, GetMessageStatus, Message};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use test_log::test;

const PRODUCERS: usize = 4;
const TOTAL_MESSAGES: usize = 50;

#[test]
fn test_concurrent_producers_fill_two_segments() {
    let config = TestConfig::new("concurrent");
    let mut store_config = config.store_config();
    store_config.mapped_file_size_commit_log = 4096;
    store_config.max_message_size = 1024;
    store_config.max_hash_slot_num = 100;
    store_config.max_index_num = 1000;
    store_config.flush_disk_type = FlushDiskType::sync_default();
    let commit_log_dir = store_config.commit_log_dir();
    let index_dir = store_config.index_dir();
    let store = Arc::new(open_store(store_config));

    // Records are a bit over 100 bytes: 36 fit in the first segment, 14 go to the next.
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut offsets = Vec::new();
                for i in (producer..TOTAL_MESSAGES).step_by(PRODUCERS) {
                    let msg = Message::new("TopicTest", 0, format!("body-{i:03}"))
                        .with_keys([format!("key-{i:02}")]);
                    let result = store.put_message(&msg);
                    assert!(result.is_ok(), "put {i} failed: {:?}", result.status);
                    let appended = result.append_result.expect("appended");
                    offsets.push((appended.wrote_offset, appended.wrote_bytes));
                }
                offsets
            })
        })
        .collect();

    let mut ranges: Vec<(u64, usize)> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("producer panicked"))
        .collect();
    assert_eq!(ranges.len(), TOTAL_MESSAGES);

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, size) = pair[0];
        assert!(start + size as u64 <= pair[1].0, "overlapping records {pair:?}");
    }
    for (start, size) in &ranges {
        assert_eq!(start / 4096, (start + *size as u64 - 1) / 4096, "record straddles segments");
    }

    wait_for_dispatch(&store);

    let mut physical = Vec::new();
    let mut offset = 0;
    loop {
        let result = store.get_message("TopicTest", 0, offset, 32, None).unwrap();
        if result.status != GetMessageStatus::Found {
            break;
        }
        physical.extend(result.messages.iter().map(|b| b.start_offset()));
        offset = result.next_begin_offset;
    }
    assert_eq!(physical.len(), TOTAL_MESSAGES);
    assert!(physical.windows(2).all(|w| w[0] < w[1]));

    for i in 0..TOTAL_MESSAGES {
        let hits = store
            .query_message("TopicTest", &format!("key-{i:02}"), 10, 0, i64::MAX)
            .unwrap();
        assert_eq!(hits.messages.len(), 1, "key-{i:02}");
    }

    store.shutdown();

    assert_eq!(list_segment_files(&commit_log_dir).unwrap().len(), 2);

    let index_files: Vec<_> = std::fs::read_dir(&index_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(index_files.len(), 1);
    let index = IndexFile::open(&index_files[0], 100, 1000).unwrap();
    assert_eq!(index.header().entry_count(), TOTAL_MESSAGES as u32);
}

#[test]
fn test_concurrent_producers_per_queue_offsets_are_dense() {
    let config = TestConfig::new("dense");
    let store = Arc::new(open_store(config.store_config()));
    let topic = config.topic_name.clone();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let topic = topic.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        let result = store.put_message(&test_message(&topic, 1, &format!("{i}")));
                        result.append_result.expect("appended").logics_offset
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let logical: HashSet<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("producer panicked"))
        .collect();
    assert_eq!(logical, (0..400).collect::<HashSet<_>>());

    wait_for_dispatch(&store);
    assert_eq!(store.get_max_offset_in_queue(&topic, 1), 400);
}

#[test]
fn test_reads_during_writes_see_a_consistent_prefix() {
    let config = TestConfig::new("prefix");
    let store = Arc::new(open_store(config.store_config()));
    let topic = config.topic_name.clone();

    let writer = {
        let store = Arc::clone(&store);
        let topic = topic.clone();
        thread::spawn(move || {
            for i in 0..300 {
                assert!(store.put_message(&test_message(&topic, 0, &format!("{i}"))).is_ok());
            }
        })
    };

    let mut next = 0u64;
    while next < 300 {
        let result = store.get_message(&topic, 0, next, 32, None).unwrap();
        for buffer in &result.messages {
            let ext = decode(buffer);
            assert_eq!(ext.queue_offset, next);
            assert_eq!(ext.message.body, next.to_string().into_bytes());
            next += 1;
        }
        if result.messages.is_empty() {
            thread::yield_now();
        }
    }
    writer.join().expect("writer panicked");
}
