//! Typed outcomes returned to the broker layer.

use std::sync::Arc;

use crate::error::{ErrorKind, StoreError};
use crate::storage::file::MappedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMessageStatus {
    PutOk,
    /// Appended, but the group commit did not confirm durability before the deadline.
    FlushDiskTimeout,
    ServiceNotAvailable,
    CreateMappedFileFailed,
    MessageIllegal,
    PropertiesSizeExceeded,
    UnknownError,
}

impl PutMessageStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PutMessageStatus::PutOk)
    }

    /// Whether the record bytes are in the log, regardless of durability.
    pub fn is_appended(&self) -> bool {
        matches!(
            self,
            PutMessageStatus::PutOk | PutMessageStatus::FlushDiskTimeout
        )
    }

    pub fn from_error(error: &StoreError) -> Self {
        match error {
            StoreError::PropertiesTooLong { .. } => PutMessageStatus::PropertiesSizeExceeded,
            StoreError::SegmentAllocationFailed { .. } => PutMessageStatus::CreateMappedFileFailed,
            StoreError::FlushTimeout { .. } => PutMessageStatus::FlushDiskTimeout,
            other => match other.kind() {
                ErrorKind::Validation => PutMessageStatus::MessageIllegal,
                ErrorKind::Unavailable => PutMessageStatus::ServiceNotAvailable,
                ErrorKind::Resource => PutMessageStatus::CreateMappedFileFailed,
                _ => PutMessageStatus::UnknownError,
            },
        }
    }
}

/// Where and when a record landed in the commit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendMessageResult {
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub msg_id: String,
    pub store_timestamp: i64,
    pub logics_offset: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutMessageResult {
    pub status: PutMessageStatus,
    pub append_result: Option<AppendMessageResult>,
}

impl PutMessageResult {
    pub fn new(status: PutMessageStatus, append_result: Option<AppendMessageResult>) -> Self {
        Self {
            status,
            append_result,
        }
    }

    pub fn failed(status: PutMessageStatus) -> Self {
        Self::new(status, None)
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// A read-only view into published bytes of one segment.
#[derive(Debug, Clone)]
pub struct SelectMappedBufferResult {
    start_offset: u64,
    mapped_file: Arc<MappedFile>,
    pos: usize,
    size: usize,
}

impl SelectMappedBufferResult {
    /// `None` unless `[pos, pos + size)` is already published in `mapped_file`.
    pub fn new(mapped_file: Arc<MappedFile>, pos: usize, size: usize) -> Option<Self> {
        mapped_file.slice(pos, size)?;
        Some(Self {
            start_offset: mapped_file.file_from_offset() + pos as u64,
            mapped_file,
            pos,
            size,
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.mapped_file.slice(self.pos, self.size).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    /// Entries exist in range but none passed the filter.
    NoMatchedMessage,
    /// Offset is at or beyond the current max; retry later from `next_begin_offset`.
    OffsetNotYetAvailable,
    /// Offset is below the retained minimum; reset to `next_begin_offset`.
    OffsetTooSmall,
    /// The topic/queue has never received a message.
    NoMatchedLogicQueue,
    /// The entry points at commit log data that is not readable.
    MessageWasRemoving,
}

#[derive(Debug, Clone)]
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub messages: Vec<SelectMappedBufferResult>,
    pub next_begin_offset: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub buffer_total_size: usize,
}

impl GetMessageResult {
    pub fn empty(status: GetMessageStatus, next_begin_offset: u64, min: u64, max: u64) -> Self {
        Self {
            status,
            messages: Vec::new(),
            next_begin_offset,
            min_offset: min,
            max_offset: max,
            buffer_total_size: 0,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOffsetResult {
    pub phy_offsets: Vec<u64>,
    pub index_last_update_timestamp: i64,
    pub index_last_update_phy_offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueryMessageResult {
    pub messages: Vec<SelectMappedBufferResult>,
    pub index_last_update_timestamp: i64,
    pub index_last_update_phy_offset: u64,
    pub buffer_total_size: usize,
}
