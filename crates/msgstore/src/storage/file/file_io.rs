use crate::error::StorageError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Thin wrappers around `std::fs` that attach context to every failure.
pub struct FileIo;

impl FileIo {
    /// Open `path` for read+write, creating it and extending it to `size` bytes.
    /// An existing file keeps its content; a longer one is left untouched.
    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn open_preallocated(path: &Path, size: u64) -> Result<File, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                StorageError::from_io_error(e, &format!("Failed to open segment file {path:?}"))
            })?;

        let current = Self::get_file_size(&file)?;
        if current < size {
            file.set_len(size).map_err(|e| {
                StorageError::from_io_error(
                    e,
                    &format!("Failed to preallocate {size} bytes for {path:?}"),
                )
            })?;
        }
        Ok(file)
    }

    /// Replace `path` with `data` via a temp file and rename.
    #[tracing::instrument(level = "debug", skip(path, data), fields(path = %path.display(), len = data.len()))]
    pub fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        {
            let mut handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| {
                    StorageError::from_io_error(e, &format!("Failed to create {tmp:?}"))
                })?;
            handle
                .write_all(data)
                .map_err(|e| StorageError::from_io_error(e, "Failed to write temp file"))?;
            Self::synchronize_to_disk(&handle)?;
        }
        std::fs::rename(&tmp, path).map_err(|e| {
            StorageError::from_io_error(e, &format!("Failed to rename {tmp:?} to {path:?}"))
        })
    }

    #[tracing::instrument(level = "debug", skip(handle))]
    pub fn synchronize_to_disk(handle: &File) -> Result<(), StorageError> {
        handle
            .sync_all()
            .map_err(|e| StorageError::from_io_error(e, "fsync"))
    }

    pub fn get_file_size(handle: &File) -> Result<u64, StorageError> {
        handle
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| StorageError::from_io_error(e, "stat segment file"))
    }

    pub fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io_error(
                e,
                &format!("Failed to remove {path:?}"),
            )),
        }
    }

    pub fn remove_dir_all_if_exists(path: &Path) -> Result<(), StorageError> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io_error(
                e,
                &format!("Failed to remove directory {path:?}"),
            )),
        }
    }
}
