use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};
use memmap2::MmapRaw;

use crate::error::StorageError;
use crate::storage::file::common::{OS_PAGE_SIZE, ensure_directory_exists};
use crate::storage::file::file_io::FileIo;

const ZERO_CHUNK: usize = OS_PAGE_SIZE;

/// A fixed-size, memory-mapped segment file.
///
/// Bytes are appended by a single writer (callers serialize appends). The write pointer is
/// published with `Release` after the copy, so any reader that observes `wrote_position`
/// with `Acquire` sees fully written bytes below it. Invariant:
/// `flushed_position <= wrote_position <= file_size`.
pub struct MappedFile {
    file_name: PathBuf,
    file_from_offset: u64,
    file_size: usize,
    wrote_position: AtomicUsize,
    flushed_position: AtomicUsize,
    mmap: MmapRaw,
    _file: File,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("file_name", &self.file_name)
            .field("file_from_offset", &self.file_from_offset)
            .field("file_size", &self.file_size)
            .field("wrote_position", &self.wrote_position())
            .field("flushed_position", &self.flushed_position())
            .finish()
    }
}

impl MappedFile {
    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn new(path: &Path, file_from_offset: u64, file_size: usize) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent)?;
        }
        let file = FileIo::open_preallocated(path, file_size as u64)?;
        let mmap = MmapRaw::map_raw(&file).map_err(|e| {
            StorageError::from_io_error(e, &format!("Failed to map segment file {path:?}"))
        })?;
        if mmap.len() < file_size {
            return Err(StorageError::DataCorruption {
                context: format!("segment {path:?}"),
                details: format!("mapped {} bytes, expected {file_size}", mmap.len()),
            });
        }
        debug!("Mapped segment {path:?} at offset {file_from_offset} ({file_size} bytes)");

        Ok(Self {
            file_name: path.to_path_buf(),
            file_from_offset,
            file_size,
            wrote_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
            mmap,
            _file: file,
        })
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn file_from_offset(&self) -> u64 {
        self.file_from_offset
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed_position.load(Ordering::Acquire)
    }

    /// Only recovery and the single appender move the write pointer directly.
    pub fn set_wrote_position(&self, pos: usize) {
        self.wrote_position
            .store(pos.min(self.file_size), Ordering::Release);
    }

    pub fn set_flushed_position(&self, pos: usize) {
        self.flushed_position
            .store(pos.min(self.file_size), Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position() == self.file_size
    }

    pub fn remaining(&self) -> usize {
        self.file_size - self.wrote_position()
    }

    /// Append `data` at the write pointer. Returns `false` if it does not fit.
    pub fn append_message(&self, data: &[u8]) -> bool {
        let pos = self.wrote_position();
        if pos + data.len() > self.file_size {
            return false;
        }
        // SAFETY: `pos + len <= file_size <= mmap.len()`. The region past the write pointer is
        // not visible to readers until the `Release` store below, and appends are serialized
        // by the owner of this segment.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mmap.as_mut_ptr().add(pos),
                data.len(),
            );
        }
        self.wrote_position
            .store(pos + data.len(), Ordering::Release);
        true
    }

    /// Write the end-of-segment marker and seal the segment.
    pub fn fill_blank(&self, marker: &[u8]) -> Result<(), StorageError> {
        let pos = self.wrote_position();
        if pos + marker.len() > self.file_size {
            return Err(StorageError::InsufficientSpace {
                context: format!("blank marker in {:?}", self.file_name),
            });
        }
        // SAFETY: same single-appender contract as `append_message`; the tail is not yet
        // published.
        unsafe {
            std::ptr::copy_nonoverlapping(
                marker.as_ptr(),
                self.mmap.as_mut_ptr().add(pos),
                marker.len(),
            );
            self.zero_unpublished(pos + marker.len(), self.file_size);
        }
        self.wrote_position.store(self.file_size, Ordering::Release);
        Ok(())
    }

    /// Published bytes `[pos, pos + len)`, or `None` if any of them is beyond the write pointer.
    pub fn slice(&self, pos: usize, len: usize) -> Option<&[u8]> {
        let wrote = self.wrote_position();
        if pos + len > wrote {
            return None;
        }
        // SAFETY: the range is below the published write pointer, so it is fully written and
        // only rewritten by recovery before any reader exists.
        Some(unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(pos), len) })
    }

    /// Published bytes from `pos` to the write pointer.
    pub fn slice_from(&self, pos: usize) -> Option<&[u8]> {
        let wrote = self.wrote_position();
        if pos > wrote {
            return None;
        }
        self.slice(pos, wrote - pos)
    }

    /// Raw access to the whole mapping regardless of the write pointer.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent `write_at` overlaps the returned range for as
    /// long as the slice is alive.
    pub unsafe fn read_at(&self, pos: usize, len: usize) -> &[u8] {
        assert!(pos + len <= self.file_size, "read past end of segment");
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(pos), len) }
    }

    /// Overwrite bytes anywhere in the mapping without touching the write pointer.
    ///
    /// # Safety
    /// The caller must exclude concurrent readers and writers of the same range.
    pub unsafe fn write_at(&self, pos: usize, data: &[u8]) {
        assert!(pos + data.len() <= self.file_size, "write past end of segment");
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mmap.as_mut_ptr().add(pos),
                data.len(),
            );
        }
    }

    /// # Safety
    /// `[from, to)` must not be visible to any reader.
    unsafe fn zero_unpublished(&self, from: usize, to: usize) {
        let mut pos = from;
        while pos < to {
            let end = (pos + ZERO_CHUNK).min(to);
            let chunk = unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(pos), end - pos) };
            if chunk.iter().any(|b| *b != 0) {
                unsafe { std::ptr::write_bytes(self.mmap.as_mut_ptr().add(pos), 0, end - pos) };
            }
            pos = end;
        }
    }

    /// Drop everything from `pos` on: move both pointers back and zero the tail on disk.
    pub fn truncate_to(&self, pos: usize) -> Result<(), StorageError> {
        let pos = pos.min(self.file_size);
        self.set_wrote_position(pos);
        if self.flushed_position() > pos {
            self.set_flushed_position(pos);
        }
        // SAFETY: truncation only runs during recovery or under the owner's write lock; the
        // range is above the new write pointer.
        unsafe { self.zero_unpublished(pos, self.file_size) };
        self.mmap
            .flush_range(pos, self.file_size - pos)
            .map_err(|e| {
                StorageError::from_io_error(e, &format!("Failed to flush {:?}", self.file_name))
            })
    }

    /// Whether at least `least_pages` dirty pages are waiting; a full segment always flushes
    /// its tail and `0` means any dirty byte.
    pub fn is_able_to_flush(&self, least_pages: usize) -> bool {
        let flushed = self.flushed_position();
        let wrote = self.wrote_position();
        if self.is_full() {
            return wrote > flushed;
        }
        if least_pages > 0 {
            return (wrote / OS_PAGE_SIZE).saturating_sub(flushed / OS_PAGE_SIZE) >= least_pages;
        }
        wrote > flushed
    }

    /// Flush dirty bytes to disk and return the new flushed position.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let wrote = self.wrote_position();
        let flushed = self.flushed_position();
        if wrote > flushed {
            self.mmap.flush_range(flushed, wrote - flushed).map_err(|e| {
                StorageError::from_io_error(e, &format!("Failed to flush {:?}", self.file_name))
            })?;
            self.flushed_position.store(wrote, Ordering::Release);
        }
        Ok(self.flushed_position())
    }

    /// Flush the whole mapping, used by structures that write in place.
    pub fn flush_all(&self) -> Result<(), StorageError> {
        self.mmap.flush().map_err(|e| {
            StorageError::from_io_error(e, &format!("Failed to flush {:?}", self.file_name))
        })
    }

    /// Delete the backing file. The mapping stays valid until the last handle is dropped.
    pub fn destroy(&self) -> Result<(), StorageError> {
        FileIo::remove_file_if_exists(&self.file_name)?;
        info!(
            "Destroyed segment {:?} (wrote {}, flushed {})",
            self.file_name,
            self.wrote_position(),
            self.flushed_position()
        );
        Ok(())
    }
}
