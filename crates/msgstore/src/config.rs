//! Store configuration and file loading.

use crate::error::StoreError;
use crate::store::consume_queue::CQ_STORE_UNIT_SIZE;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the commit log reaches the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushDiskType {
    /// Producers wait for a group-commit round covering their record.
    Sync { timeout_ms: u64 },
    /// Producers return immediately; a timer flushes in the background.
    Async { interval_ms: u64 },
}

impl Default for FlushDiskType {
    fn default() -> Self {
        FlushDiskType::Async { interval_ms: 500 }
    }
}

impl FlushDiskType {
    pub fn sync_default() -> Self {
        FlushDiskType::Sync { timeout_ms: 5000 }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, FlushDiskType::Sync { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_path_root_dir: PathBuf,
    pub mapped_file_size_commit_log: usize,
    pub mapped_file_size_consume_queue: usize,
    pub flush_disk_type: FlushDiskType,
    pub flush_commit_log_least_pages: usize,
    pub flush_commit_log_thorough_interval_ms: u64,
    pub flush_consume_queue_interval_ms: u64,
    pub group_commit_poll_interval_ms: u64,
    pub dispatch_poll_interval_ms: u64,
    pub max_message_size: usize,
    pub max_hash_slot_num: u32,
    pub max_index_num: u32,
    pub message_index_enable: bool,
    pub max_transfer_bytes_on_message: usize,
    pub max_transfer_count_on_message: usize,
    pub max_recovery_truncate_bytes: u64,
    pub store_host: SocketAddrV4,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path_root_dir: PathBuf::from("./store"),
            mapped_file_size_commit_log: 1024 * 1024 * 1024,
            mapped_file_size_consume_queue: 300_000 * CQ_STORE_UNIT_SIZE,
            flush_disk_type: FlushDiskType::default(),
            flush_commit_log_least_pages: 4,
            flush_commit_log_thorough_interval_ms: 10_000,
            flush_consume_queue_interval_ms: 1000,
            group_commit_poll_interval_ms: 10,
            dispatch_poll_interval_ms: 1,
            max_message_size: 512 * 1024,
            max_hash_slot_num: 5_000_000,
            max_index_num: 20_000_000,
            message_index_enable: true,
            max_transfer_bytes_on_message: 256 * 1024,
            max_transfer_count_on_message: 32,
            max_recovery_truncate_bytes: 1024 * 1024,
            store_host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10911),
        }
    }
}

impl StoreConfig {
    pub fn with_root_dir<P: AsRef<Path>>(root: P) -> Self {
        Self {
            store_path_root_dir: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load from a `.json`, `.yaml` or `.yml` file; unknown extensions try JSON then YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::InvalidConfig {
            field: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let parse_error = |reason: String| StoreError::InvalidConfig {
            field: path.display().to_string(),
            reason,
        };

        let config: StoreConfig = match extension.to_lowercase().as_str() {
            "json" => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
            }
            _ => serde_json::from_str(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .map_err(|e| parse_error(format!("tried both JSON and YAML: {e}")))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |field: &str, reason: &str| {
            Err(StoreError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.mapped_file_size_commit_log < 1024 {
            return invalid(
                "mapped_file_size_commit_log",
                "must be at least 1024 bytes",
            );
        }
        if self.max_message_size == 0 || self.max_message_size >= self.mapped_file_size_commit_log
        {
            return invalid(
                "max_message_size",
                "must be positive and smaller than a commit log segment",
            );
        }
        if self.mapped_file_size_consume_queue < CQ_STORE_UNIT_SIZE {
            return invalid(
                "mapped_file_size_consume_queue",
                "must hold at least one entry",
            );
        }
        if self.max_hash_slot_num == 0 {
            return invalid("max_hash_slot_num", "must be positive");
        }
        if self.max_index_num < 2 {
            return invalid("max_index_num", "must be at least 2");
        }
        match self.flush_disk_type {
            FlushDiskType::Sync { timeout_ms: 0 } => {
                invalid("flush_disk_type.timeout_ms", "must be positive")
            }
            FlushDiskType::Async { interval_ms: 0 } => {
                invalid("flush_disk_type.interval_ms", "must be positive")
            }
            _ => Ok(()),
        }
    }

    /// Consume queue segments always hold a whole number of entries.
    pub fn consume_queue_file_size(&self) -> usize {
        self.mapped_file_size_consume_queue.div_ceil(CQ_STORE_UNIT_SIZE) * CQ_STORE_UNIT_SIZE
    }

    pub fn commit_log_dir(&self) -> PathBuf {
        self.store_path_root_dir.join("commitlog")
    }

    pub fn consume_queue_dir(&self) -> PathBuf {
        self.store_path_root_dir.join("consumequeue")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.store_path_root_dir.join("index")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.store_path_root_dir.join("checkpoint")
    }

    pub fn abort_path(&self) -> PathBuf {
        self.store_path_root_dir.join("abort")
    }

    pub fn group_commit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.group_commit_poll_interval_ms.max(1))
    }

    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms.max(1))
    }

    pub fn flush_consume_queue_interval(&self) -> Duration {
        Duration::from_millis(self.flush_consume_queue_interval_ms.max(1))
    }
}
