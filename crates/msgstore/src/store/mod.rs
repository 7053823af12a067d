pub mod checkpoint;
pub mod commit_log;
pub mod consume_queue;
pub mod dispatch;
pub mod filter;
pub mod flush;
pub mod index_file;
pub mod index_service;
pub mod message_store;
pub mod result;
pub mod service;
pub mod stats;

pub use commit_log::CommitLog;
pub use consume_queue::{ConsumeQueue, ConsumeQueueTable};
pub use filter::{AcceptAll, MessageFilter, TagFilter};
pub use index_service::IndexService;
pub use message_store::{DefaultMessageStore, StoreState};
pub use result::{
    GetMessageResult, GetMessageStatus, PutMessageResult, PutMessageStatus, QueryMessageResult,
};
pub use stats::{NoopStats, StatsSink, StoreStatsService};
