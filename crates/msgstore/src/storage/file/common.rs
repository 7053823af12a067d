use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Width of segment file names: zero-padded base offset.
pub const FILE_NAME_WIDTH: usize = 20;

pub const OS_PAGE_SIZE: usize = 4096;

// ================================================================================================
// FILE NAMING
// ================================================================================================

pub fn offset_to_file_name(offset: u64) -> String {
    format!("{offset:020}")
}

pub fn file_name_to_offset(name: &str) -> Option<u64> {
    if name.len() != FILE_NAME_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

pub fn ensure_directory_exists<P: AsRef<Path>>(dir: P) -> Result<(), StorageError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            StorageError::from_io_error(e, &format!("Failed to create directory {dir:?}"))
        })?;
    }
    Ok(())
}

/// Segment files in `dir` sorted by base offset; anything not named like a segment is ignored.
pub fn list_segment_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StorageError::from_io_error(e, &format!("Failed to list {dir:?}")))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| StorageError::from_io_error(e, "Failed to read directory entry"))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(offset) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(file_name_to_offset)
        {
            segments.push((offset, path));
        }
    }
    segments.sort_by_key(|(offset, _)| *offset);
    Ok(segments)
}

// ================================================================================================
// BIG-ENDIAN FIELD ACCESS
// ================================================================================================
// Callers check bounds before reading; these only slice.

pub fn read_u16_at(buf: &[u8], pos: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[pos..pos + 2]);
    u16::from_be_bytes(bytes)
}

pub fn read_u32_at(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_be_bytes(bytes)
}

pub fn read_i32_at(buf: &[u8], pos: usize) -> i32 {
    read_u32_at(buf, pos) as i32
}

pub fn read_u64_at(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_be_bytes(bytes)
}

pub fn read_i64_at(buf: &[u8], pos: usize) -> i64 {
    read_u64_at(buf, pos) as i64
}

pub fn write_u64_at(buf: &mut [u8], pos: usize, value: u64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}

pub fn write_i64_at(buf: &mut [u8], pos: usize, value: i64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
