pub mod common;
pub mod file_io;
pub mod lock;
pub mod mapped_file;
pub mod mapped_file_queue;

pub use file_io::FileIo;
pub use lock::DirectoryLock;
pub use mapped_file::MappedFile;
pub use mapped_file_queue::MappedFileQueue;
