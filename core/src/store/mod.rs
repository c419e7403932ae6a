// Store module: storage backends and the participant directory

pub mod backend;
pub mod directory;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use directory::{Directory, DirectoryError, StorageDirectory};
