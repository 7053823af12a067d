pub mod file;

pub use file::{DirectoryLock, FileIo, MappedFile, MappedFileQueue};
