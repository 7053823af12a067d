use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use log::{debug, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::StorageError;
use crate::storage::file::common::ensure_directory_exists;

pub const LOCK_FILE_NAME: &str = ".msgstore.lock";

const IN_USE: &str = "store root is held by another message store";

/// Exclusive ownership of a store directory for the lifetime of this value.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    _file: File,
}

/// Contents of the lock file: who holds the store and since when.
#[derive(Debug, Clone, PartialEq)]
struct LockOwner {
    pid: u32,
    acquired_at: Option<DateTime<Utc>>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Some(Utc::now()),
        }
    }

    fn render(&self) -> String {
        let mut out = format!("pid={}\n", self.pid);
        if let Some(at) = self.acquired_at {
            out.push_str(&format!("acquired_at={}\n", at.to_rfc3339()));
        }
        out
    }

    fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut acquired_at = None;
        for line in text.lines() {
            match line.split_once('=') {
                Some(("pid", v)) => pid = v.trim().parse().ok(),
                Some(("acquired_at", v)) => {
                    acquired_at = DateTime::parse_from_rfc3339(v.trim())
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                }
                _ => {}
            }
        }
        pid.map(|pid| Self { pid, acquired_at })
    }

    fn is_running(&self) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(self.pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        system.process(pid).is_some()
    }
}

impl DirectoryLock {
    #[tracing::instrument(level = "debug", skip(root), fields(dir = %root.as_ref().display()))]
    pub fn acquire<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref();
        ensure_directory_exists(root)?;
        let path = root.join(LOCK_FILE_NAME);

        if let Some(lock) = Self::try_claim(&path)? {
            return Ok(lock);
        }

        // Locked with no readable owner: the holder may not have recorded itself yet.
        let Some(owner) = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| LockOwner::parse(&text))
        else {
            return Err(StorageError::DirectoryLocked {
                context: IN_USE.to_string(),
                pid: None,
            });
        };
        if owner.is_running() {
            return Err(StorageError::DirectoryLocked {
                context: IN_USE.to_string(),
                pid: Some(owner.pid),
            });
        }

        // Holder is gone; one retry against a fresh file.
        if std::fs::remove_file(&path).is_err() {
            return Err(StorageError::DirectoryLocked {
                context: IN_USE.to_string(),
                pid: None,
            });
        }
        warn!("Reclaiming store lock {path:?} left by pid {}", owner.pid);
        Self::try_claim(&path)?.ok_or(StorageError::LockAcquisitionFailed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when another handle already holds the file lock.
    fn try_claim(path: &Path) -> Result<Option<Self>, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::from_io_error(e, "open store lock file"))?;

        if !matches!(file.try_lock_exclusive(), Ok(true)) {
            return Ok(None);
        }

        file.set_len(0)
            .and_then(|_| (&file).write_all(LockOwner::current().render().as_bytes()))
            .map_err(|e| StorageError::from_io_error(e, "record store lock owner"))?;
        debug!("Acquired store lock {path:?}");
        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove store lock {:?}: {e}", self.path);
            }
        }
    }
}
