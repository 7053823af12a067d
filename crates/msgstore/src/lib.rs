pub mod config;
pub mod error;
pub mod message;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use config::{FlushDiskType, StoreConfig};
pub use error::{ErrorKind, StorageError, StoreError};
pub use message::{Message, MessageExt};
pub use store::{
    DefaultMessageStore, GetMessageResult, GetMessageStatus, MessageFilter, PutMessageResult,
    PutMessageStatus, QueryMessageResult, StatsSink, StoreState, TagFilter,
};

// Re-export logging macros for consistent usage across the crate
pub use log::{debug, error, info, trace, warn};
