use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use log::{info, warn};
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::message::DispatchRequest;
use crate::storage::file::FileIo;
use crate::storage::file::common::{ensure_directory_exists, now_millis};
use crate::store::index_file::{IndexFile, PutKeyOutcome};
use crate::store::result::QueryOffsetResult;

const INDEX_FILE_NAME_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// `topic#key`, the unit the hash index is keyed on.
pub fn build_index_key(topic: &str, key: &str) -> String {
    format!("{topic}#{key}")
}

/// Owns the ordered list of index files; only the last one accepts writes.
pub struct IndexService {
    index_dir: PathBuf,
    slot_num: u32,
    index_num: u32,
    files: RwLock<Vec<Arc<IndexFile>>>,
}

impl IndexService {
    pub fn new<P: AsRef<Path>>(index_dir: P, slot_num: u32, index_num: u32) -> Self {
        Self {
            index_dir: index_dir.as_ref().to_path_buf(),
            slot_num,
            index_num,
            files: RwLock::new(Vec::new()),
        }
    }

    /// Open every index file in name order.
    ///
    /// Files that may point past `max_phy_offset` are dropped, as are files holding entries
    /// newer than `index_msg_timestamp` after an unclean exit. Returns the lowest commit log
    /// offset the dropped files covered, so the caller can re-dispatch from there.
    #[tracing::instrument(level = "info", skip(self), fields(dir = %self.index_dir.display()))]
    pub fn load(
        &self,
        last_exit_ok: bool,
        index_msg_timestamp: i64,
        max_phy_offset: u64,
    ) -> Result<Option<u64>, StorageError> {
        ensure_directory_exists(&self.index_dir)?;
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.index_dir).map_err(|e| {
            StorageError::from_io_error(e, &format!("Failed to list {:?}", self.index_dir))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                StorageError::from_io_error(e, &format!("Failed to list {:?}", self.index_dir))
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                names.push(name);
            }
        }
        names.sort();

        let mut files = self.files.write();
        files.clear();
        let mut rebuild_from: Option<u64> = None;
        for name in names {
            let path = self.index_dir.join(&name);
            let file = IndexFile::open(&path, self.slot_num, self.index_num)?;
            let header = file.header();
            let stale = !last_exit_ok && header.end_timestamp > index_msg_timestamp;
            let dangling = header.entry_count() > 0 && header.end_phy_offset >= max_phy_offset;
            if stale || dangling {
                warn!(
                    "Dropping index file {path:?}: last entry at {} (offset {}), checkpoint {}, \
                     commit log max {max_phy_offset}",
                    header.end_timestamp, header.end_phy_offset, index_msg_timestamp
                );
                if header.entry_count() > 0 {
                    let begin = header.begin_phy_offset;
                    rebuild_from = Some(rebuild_from.map_or(begin, |o| o.min(begin)));
                }
                file.destroy()?;
                continue;
            }
            files.push(Arc::new(file));
        }
        info!("Loaded {} index files", files.len());
        Ok(rebuild_from)
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn files(&self) -> Vec<Arc<IndexFile>> {
        self.files.read().clone()
    }

    /// Index every key of a dispatched record.
    pub fn build_index(&self, request: &DispatchRequest) -> Result<(), StorageError> {
        let keys: Vec<&str> = request
            .keys
            .split(crate::message::KEY_SEPARATOR)
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        if let Some(last) = self.files.read().last() {
            let header = last.header();
            if header.entry_count() > 0 && request.commit_log_offset <= header.end_phy_offset {
                // Already indexed before the restart.
                return Ok(());
            }
        }

        let mut file = self.get_and_create_last_index_file()?;
        for key in keys {
            let index_key = build_index_key(&request.topic, key);
            loop {
                match file.put_key(&index_key, request.commit_log_offset, request.store_timestamp)
                {
                    PutKeyOutcome::Stored => break,
                    outcome => {
                        info!(
                            "Index file {:?} sealed ({outcome:?}), rolling",
                            file.path()
                        );
                        file = self.roll_index_file(&file)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn get_and_create_last_index_file(&self) -> Result<Arc<IndexFile>, StorageError> {
        if let Some(last) = self.files.read().last() {
            if !last.is_write_full() {
                return Ok(Arc::clone(last));
            }
        }
        let mut files = self.files.write();
        if let Some(last) = files.last() {
            if !last.is_write_full() {
                return Ok(Arc::clone(last));
            }
        }
        self.create_file(&mut files)
    }

    /// Replace `sealed` as the writable file unless someone already did.
    fn roll_index_file(&self, sealed: &Arc<IndexFile>) -> Result<Arc<IndexFile>, StorageError> {
        let mut files = self.files.write();
        if let Some(last) = files.last() {
            if !Arc::ptr_eq(last, sealed) {
                return Ok(Arc::clone(last));
            }
        }
        if let Err(e) = sealed.flush() {
            warn!("Failed to flush sealed index file {:?}: {e}", sealed.path());
        }
        self.create_file(&mut files)
    }

    fn create_file(&self, files: &mut Vec<Arc<IndexFile>>) -> Result<Arc<IndexFile>, StorageError> {
        let mut stamp = Local
            .timestamp_millis_opt(now_millis())
            .single()
            .map(|t| t.format(INDEX_FILE_NAME_FORMAT).to_string())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let last_name = files
            .last()
            .and_then(|f| f.path().file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(last) = last_name {
            if stamp <= last {
                stamp = last + 1;
            }
        }
        let path = self.index_dir.join(format!("{stamp:017}"));
        let file = Arc::new(IndexFile::create(&path, self.slot_num, self.index_num)?);
        info!("Created index file {path:?}");
        files.push(Arc::clone(&file));
        Ok(file)
    }

    /// Offsets indexed for `topic#key` within `[begin, end]`, newest first.
    pub fn query_offset(
        &self,
        topic: &str,
        key: &str,
        max_num: usize,
        begin: i64,
        end: i64,
    ) -> QueryOffsetResult {
        let files = self.files();
        let mut result = QueryOffsetResult::default();
        if let Some(last) = files.last() {
            result.index_last_update_timestamp = last.end_timestamp();
            result.index_last_update_phy_offset = last.end_phy_offset();
        }

        let index_key = build_index_key(topic, key);
        for file in files.iter().rev() {
            if result.phy_offsets.len() >= max_num {
                break;
            }
            if !file.is_time_matched(begin, end) {
                continue;
            }
            let remaining = max_num - result.phy_offsets.len();
            result
                .phy_offsets
                .extend(file.select_phy_offset(&index_key, remaining, begin, end));
        }
        result
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        for file in self.files() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush index files on shutdown: {e}");
        }
        self.files.write().clear();
    }

    pub fn destroy(&self) -> Result<(), StorageError> {
        let mut files = self.files.write();
        for file in files.drain(..) {
            file.destroy()?;
        }
        FileIo::remove_dir_all_if_exists(&self.index_dir)
    }
}
