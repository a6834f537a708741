mod kv;
mod loader;

pub use kv::{KvBackend, MemoryBackend, NoopBackend, SledBackend, SledDatabase, StorageError};
pub use loader::{DirectoryLoader, FsDirectoryLoader, LoaderError, StaticTreeLoader};
