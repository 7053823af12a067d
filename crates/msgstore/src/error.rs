use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    MessageInvalid {
        reason: String,
    },
    PropertiesTooLong {
        size: usize,
        max: usize,
    },
    ServiceUnavailable {
        context: String,
    },
    SegmentAllocationFailed {
        path: String,
        reason: String,
    },
    FlushTimeout {
        offset: u64,
    },
    Corruption {
        context: String,
        details: String,
    },
    NotFound {
        context: String,
    },
    InvalidConfig {
        field: String,
        reason: String,
    },
    Storage(StorageError),
}

/// Coarse classification used by callers that only care about the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Resource,
    Timeout,
    Corruption,
    NotFound,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ReadFailed {
        context: String,
        source: Box<StorageErrorSource>,
    },
    WriteFailed {
        context: String,
        source: Box<StorageErrorSource>,
    },
    InsufficientSpace {
        context: String,
    },
    PermissionDenied {
        context: String,
    },
    DataCorruption {
        context: String,
        details: String,
    },
    Unavailable {
        context: String,
    },
    DirectoryLocked {
        context: String,
        pid: Option<u32>,
    },
    LockAcquisitionFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageErrorSource {
    Io(String),
    Serialization(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::MessageInvalid { reason } => write!(f, "Invalid message: {reason}"),
            StoreError::PropertiesTooLong { size, max } => {
                write!(f, "Message properties too long: {size} bytes (max {max})")
            }
            StoreError::ServiceUnavailable { context } => {
                write!(f, "Store service unavailable: {context}")
            }
            StoreError::SegmentAllocationFailed { path, reason } => {
                write!(f, "Failed to allocate segment '{path}': {reason}")
            }
            StoreError::FlushTimeout { offset } => {
                write!(f, "Flush not confirmed up to offset {offset} before timeout")
            }
            StoreError::Corruption { context, details } => {
                write!(f, "Corruption in {context}: {details}")
            }
            StoreError::NotFound { context } => write!(f, "Not found: {context}"),
            StoreError::InvalidConfig { field, reason } => {
                write!(f, "Invalid configuration for '{field}': {reason}")
            }
            StoreError::Storage(err) => write!(f, "Storage error: {err}"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ReadFailed { context, source } => {
                write!(f, "cannot read ({context}): {source}")
            }
            StorageError::WriteFailed { context, source } => {
                write!(f, "cannot write ({context}): {source}")
            }
            StorageError::InsufficientSpace { context } => write!(f, "out of space ({context})"),
            StorageError::PermissionDenied { context } => {
                write!(f, "permission denied ({context})")
            }
            StorageError::DataCorruption { context, details } => {
                write!(f, "corrupt data ({context}): {details}")
            }
            StorageError::Unavailable { context } => write!(f, "storage offline ({context})"),
            StorageError::DirectoryLocked { context, pid: Some(pid) } => {
                write!(f, "{context}, owner pid {pid}")
            }
            StorageError::DirectoryLocked { context, pid: None } => write!(f, "{context}"),
            StorageError::LockAcquisitionFailed => write!(f, "store lock could not be taken"),
        }
    }
}

impl fmt::Display for StorageErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorSource::Io(msg) => write!(f, "io: {msg}"),
            StorageErrorSource::Serialization(msg) => write!(f, "encode: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
impl std::error::Error for StorageError {}
impl std::error::Error for StorageErrorSource {}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::MessageInvalid { .. }
            | StoreError::PropertiesTooLong { .. }
            | StoreError::InvalidConfig { .. } => ErrorKind::Validation,
            StoreError::SegmentAllocationFailed { .. } => ErrorKind::Resource,
            StoreError::FlushTimeout { .. } => ErrorKind::Timeout,
            StoreError::Corruption { .. } => ErrorKind::Corruption,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::ServiceUnavailable { .. } => ErrorKind::Unavailable,
            StoreError::Storage(err) => match err {
                StorageError::DataCorruption { .. } => ErrorKind::Corruption,
                StorageError::InsufficientSpace { .. } | StorageError::PermissionDenied { .. } => {
                    ErrorKind::Resource
                }
                StorageError::Unavailable { .. }
                | StorageError::DirectoryLocked { .. }
                | StorageError::LockAcquisitionFailed => ErrorKind::Unavailable,
                StorageError::ReadFailed { .. } | StorageError::WriteFailed { .. } => {
                    ErrorKind::Unknown
                }
            },
        }
    }

    /// The request itself is at fault; resending it unchanged fails the same way.
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Unavailable | ErrorKind::Resource
        )
    }

    pub fn invalid_message(reason: impl Into<String>) -> Self {
        StoreError::MessageInvalid {
            reason: reason.into(),
        }
    }

    pub fn unavailable(context: impl Into<String>) -> Self {
        StoreError::ServiceUnavailable {
            context: context.into(),
        }
    }

    pub fn corruption(context: impl Into<String>, details: impl Into<String>) -> Self {
        StoreError::Corruption {
            context: context.into(),
            details: details.into(),
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DataCorruption { context, details } => {
                StoreError::Corruption { context, details }
            }
            other => StoreError::Storage(other),
        }
    }
}

impl StorageError {
    pub fn from_io_error(e: std::io::Error, context: &str) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                context: context.to_string(),
            },
            std::io::ErrorKind::OutOfMemory | std::io::ErrorKind::StorageFull => {
                StorageError::InsufficientSpace {
                    context: context.to_string(),
                }
            }
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::NotFound => {
                StorageError::ReadFailed {
                    context: context.to_string(),
                    source: Box::new(StorageErrorSource::Io(e.to_string())),
                }
            }
            _ => StorageError::WriteFailed {
                context: context.to_string(),
                source: Box::new(StorageErrorSource::Io(e.to_string())),
            },
        }
    }

    pub fn from_serialization_error(e: impl std::fmt::Display, context: &str) -> Self {
        StorageError::DataCorruption {
            context: context.to_string(),
            details: e.to_string(),
        }
    }
}
