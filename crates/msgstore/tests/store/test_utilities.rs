use msgstore::message::decode_message;
use msgstore::store::result::SelectMappedBufferResult;
use msgstore::{DefaultMessageStore, FlushDiskType, Message, MessageExt, StoreConfig};
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Generate a unique test ID for isolating test data
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")
}

/// Create a temporary directory for testing using tempdir()
pub fn create_test_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(&format!("msgstore_{prefix}_"))
        .tempdir()
        .expect("Failed to create temporary directory")
}

/// Create a unique topic name for testing
pub fn create_test_topic(prefix: &str) -> String {
    let test_id = generate_test_id();
    format!("{prefix}_{}", &test_id[..8])
}

pub fn test_message(topic: &str, queue_id: u32, body: &str) -> Message {
    Message::new(topic, queue_id, body)
}

pub fn decode(buffer: &SelectMappedBufferResult) -> MessageExt {
    decode_message(buffer.as_bytes()).expect("stored record should decode")
}

/// Small segments and indexes so tests exercise rolling.
pub fn small_config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::with_root_dir(dir);
    config.mapped_file_size_commit_log = 64 * 1024;
    config.max_message_size = 4 * 1024;
    config.mapped_file_size_consume_queue = 100 * 20;
    config.max_hash_slot_num = 128;
    config.max_index_num = 1024;
    config.flush_disk_type = FlushDiskType::Async { interval_ms: 10 };
    config.flush_consume_queue_interval_ms = 10;
    config
}

pub fn open_store(config: StoreConfig) -> DefaultMessageStore {
    let store = DefaultMessageStore::new(config).expect("valid config");
    assert!(store.load().expect("load should not fail"));
    store.start().expect("start should not fail");
    store
}

/// Block until the dispatcher has caught up with the commit log.
pub fn wait_for_dispatch(store: &DefaultMessageStore) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.dispatch_behind_bytes() > 0 {
        assert!(Instant::now() < deadline, "dispatcher did not catch up");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Common test configuration
pub struct TestConfig {
    pub temp_dir: tempfile::TempDir,
    pub topic_name: String,
}

impl TestConfig {
    pub fn new(prefix: &str) -> Self {
        Self {
            temp_dir: create_test_dir(prefix),
            topic_name: create_test_topic(prefix),
        }
    }

    /// Get the path to the temporary directory
    pub fn temp_dir_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store_config(&self) -> StoreConfig {
        small_config(self.temp_dir_path())
    }
}

// TempDir automatically cleans up on drop, no manual cleanup needed
