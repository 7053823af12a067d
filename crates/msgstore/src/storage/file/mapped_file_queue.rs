use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;
use crate::storage::file::common::{list_segment_files, offset_to_file_name};
use crate::storage::file::file_io::FileIo;
use crate::storage::file::mapped_file::MappedFile;

/// Ordered, contiguous run of equally sized segments addressed by base offset.
///
/// Segment `i` covers `[base_0 + i * size, base_0 + (i + 1) * size)`.
#[derive(Debug)]
pub struct MappedFileQueue {
    store_path: PathBuf,
    mapped_file_size: usize,
    mapped_files: RwLock<Vec<Arc<MappedFile>>>,
    flushed_where: AtomicU64,
    flush_lock: Mutex<()>,
}

impl MappedFileQueue {
    pub fn new<P: AsRef<Path>>(store_path: P, mapped_file_size: usize) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
            mapped_file_size,
            mapped_files: RwLock::new(Vec::new()),
            flushed_where: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn mapped_file_size(&self) -> usize {
        self.mapped_file_size
    }

    /// Map every existing segment as fully written; recovery moves the pointers back.
    #[tracing::instrument(level = "info", skip(self), fields(path = %self.store_path.display()))]
    pub fn load(&self) -> Result<(), StorageError> {
        let segments = list_segment_files(&self.store_path)?;
        let mut files = self.mapped_files.write();

        for (offset, path) in segments {
            let len = std::fs::metadata(&path)
                .map_err(|e| StorageError::from_io_error(e, &format!("Failed to stat {path:?}")))?
                .len();
            if len != self.mapped_file_size as u64 {
                return Err(StorageError::DataCorruption {
                    context: format!("segment {path:?}"),
                    details: format!(
                        "length {len} does not match configured segment size {}",
                        self.mapped_file_size
                    ),
                });
            }
            if let Some(prev) = files.last() {
                if prev.file_from_offset() + self.mapped_file_size as u64 != offset {
                    return Err(StorageError::DataCorruption {
                        context: format!("segment {path:?}"),
                        details: format!(
                            "base offset {offset} does not follow {}",
                            prev.file_from_offset()
                        ),
                    });
                }
            }

            let mapped = MappedFile::new(&path, offset, self.mapped_file_size)?;
            mapped.set_wrote_position(self.mapped_file_size);
            mapped.set_flushed_position(self.mapped_file_size);
            info!("Loaded segment {path:?}");
            files.push(Arc::new(mapped));
        }
        Ok(())
    }

    pub fn mapped_files(&self) -> Vec<Arc<MappedFile>> {
        self.mapped_files.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped_files.read().is_empty()
    }

    pub fn get_first_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.mapped_files.read().first().cloned()
    }

    pub fn get_last_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.mapped_files.read().last().cloned()
    }

    /// The segment that should receive the next append, allocating one if the last is full
    /// or none exists yet. `start_offset` picks the base for a brand-new queue.
    pub fn get_last_mapped_file_or_create(
        &self,
        start_offset: u64,
    ) -> Result<Arc<MappedFile>, StorageError> {
        if let Some(last) = self.get_last_mapped_file() {
            if !last.is_full() {
                return Ok(last);
            }
        }

        let mut files = self.mapped_files.write();
        let create_offset = match files.last() {
            Some(last) if !last.is_full() => return Ok(Arc::clone(last)),
            Some(last) => last.file_from_offset() + self.mapped_file_size as u64,
            None => start_offset - start_offset % self.mapped_file_size as u64,
        };

        let path = self.store_path.join(offset_to_file_name(create_offset));
        let mapped = Arc::new(MappedFile::new(&path, create_offset, self.mapped_file_size)?);
        info!("Allocated segment {path:?}");
        files.push(Arc::clone(&mapped));
        Ok(mapped)
    }

    /// Segment containing `offset`. With `return_first_on_not_found` an out-of-range offset
    /// falls back to the first segment.
    pub fn find_mapped_file_by_offset(
        &self,
        offset: u64,
        return_first_on_not_found: bool,
    ) -> Option<Arc<MappedFile>> {
        let files = self.mapped_files.read();
        let first = files.first()?;
        let size = self.mapped_file_size as u64;

        if offset >= first.file_from_offset() {
            let index = ((offset - first.file_from_offset()) / size) as usize;
            if let Some(mapped) = files.get(index) {
                if offset < mapped.file_from_offset() + size {
                    return Some(Arc::clone(mapped));
                }
            }
        }

        if return_first_on_not_found {
            Some(Arc::clone(first))
        } else {
            None
        }
    }

    pub fn get_min_offset(&self) -> u64 {
        self.get_first_mapped_file()
            .map(|f| f.file_from_offset())
            .unwrap_or(0)
    }

    pub fn get_max_offset(&self) -> u64 {
        self.get_last_mapped_file()
            .map(|f| f.file_from_offset() + f.wrote_position() as u64)
            .unwrap_or(0)
    }

    pub fn flushed_where(&self) -> u64 {
        self.flushed_where.load(Ordering::Acquire)
    }

    pub fn set_flushed_where(&self, offset: u64) {
        self.flushed_where.store(offset, Ordering::Release);
    }

    /// Bytes written but not yet flushed.
    pub fn how_much_fall_behind(&self) -> u64 {
        self.get_max_offset().saturating_sub(self.flushed_where())
    }

    /// Flush from `flushed_where` forward, crossing segment boundaries until nothing is left
    /// that meets the `least_pages` threshold. Returns the new flushed offset.
    pub fn flush(&self, least_pages: usize) -> Result<u64, StorageError> {
        let _guard = self.flush_lock.lock();
        loop {
            let flushed_where = self.flushed_where();
            let Some(mapped) = self.find_mapped_file_by_offset(flushed_where, flushed_where == 0)
            else {
                break;
            };
            if !mapped.is_able_to_flush(least_pages) {
                break;
            }
            let position = mapped.flush()?;
            let new_where = mapped.file_from_offset() + position as u64;
            if new_where <= flushed_where {
                break;
            }
            self.set_flushed_where(new_where);
        }
        Ok(self.flushed_where())
    }

    /// Remove everything at or beyond `offset`: the owning segment is cut back and zero
    /// filled, later segments are deleted.
    #[tracing::instrument(level = "info", skip(self), fields(path = %self.store_path.display()))]
    pub fn truncate_dirty_files(&self, offset: u64) -> Result<(), StorageError> {
        let mut files = self.mapped_files.write();
        let size = self.mapped_file_size as u64;
        let mut kept = Vec::with_capacity(files.len());

        for mapped in files.drain(..) {
            let tail = mapped.file_from_offset() + size;
            if tail <= offset {
                kept.push(mapped);
            } else if offset >= mapped.file_from_offset() {
                mapped.truncate_to((offset - mapped.file_from_offset()) as usize)?;
                kept.push(mapped);
            } else {
                warn!("Deleting dirty segment {:?}", mapped.file_name());
                mapped.destroy()?;
            }
        }
        *files = kept;

        if self.flushed_where() > offset {
            self.set_flushed_where(offset);
        }
        Ok(())
    }

    /// Delete every segment and the directory itself.
    pub fn destroy(&self) -> Result<(), StorageError> {
        let mut files = self.mapped_files.write();
        for mapped in files.drain(..) {
            mapped.destroy()?;
        }
        self.set_flushed_where(0);
        FileIo::remove_dir_all_if_exists(&self.store_path)
    }

    /// Release the mappings without touching the files.
    pub fn shutdown(&self) {
        self.mapped_files.write().clear();
    }
}
