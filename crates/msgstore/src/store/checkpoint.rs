use std::path::{Path, PathBuf};

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageErrorSource};
use crate::storage::file::FileIo;

/// Durable progress markers used to pick the recovery strategy and dispatcher resume point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Commit log bytes below this offset are known to be on disk.
    pub physic_flushed_offset: u64,
    pub physic_msg_timestamp: i64,
    /// Every record below this offset has durable consume queue and index entries.
    pub dispatched_offset: u64,
    pub logics_msg_timestamp: i64,
    pub index_msg_timestamp: i64,
}

#[derive(Debug)]
pub struct StoreCheckpoint {
    path: PathBuf,
    state: Mutex<CheckpointState>,
    existed: bool,
}

impl StoreCheckpoint {
    #[tracing::instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let (state, existed) = match std::fs::read(&path) {
            Ok(bytes) => {
                let state: CheckpointState = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::from_serialization_error(e, "Failed to parse store checkpoint")
                })?;
                info!("Loaded store checkpoint {state:?}");
                (state, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (CheckpointState::default(), false)
            }
            Err(e) => {
                return Err(StorageError::from_io_error(
                    e,
                    "Failed to read store checkpoint",
                ));
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            existed,
        })
    }

    /// Whether a checkpoint file was found at load time.
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn snapshot(&self) -> CheckpointState {
        *self.state.lock()
    }

    pub fn set_physic_flushed(&self, offset: u64, timestamp: i64) {
        let mut state = self.state.lock();
        if offset > state.physic_flushed_offset {
            state.physic_flushed_offset = offset;
            state.physic_msg_timestamp = timestamp;
        }
    }

    pub fn set_dispatched(&self, offset: u64, timestamp: i64) {
        let mut state = self.state.lock();
        if offset > state.dispatched_offset {
            state.dispatched_offset = offset;
            state.logics_msg_timestamp = timestamp;
            state.index_msg_timestamp = timestamp;
        }
    }

    /// Recovery may legitimately move progress backwards after truncation.
    pub fn reset(&self, physic_flushed_offset: u64, dispatched_offset: u64) {
        let mut state = self.state.lock();
        state.physic_flushed_offset = state.physic_flushed_offset.min(physic_flushed_offset);
        state.dispatched_offset = state.dispatched_offset.min(dispatched_offset);
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let state = self.snapshot();
        let bytes =
            serde_json::to_vec_pretty(&state).map_err(|e| StorageError::WriteFailed {
                context: format!("checkpoint {:?}", self.path),
                source: Box::new(StorageErrorSource::Serialization(e.to_string())),
            })?;
        FileIo::write_atomically(&self.path, &bytes)
    }
}
