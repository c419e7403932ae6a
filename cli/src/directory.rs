// Participant directory shared between loopmix processes
//
// sled holds an exclusive lock on its database while open, so every call
// opens the database, does its work and closes it again. Opening retries for
// a while when another process holds the lock.

use loopmix_core::descriptor::{ParticipantDescriptor, ParticipantKind};
use loopmix_core::store::{Directory, DirectoryError, SledStorage, StorageDirectory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const OPEN_ATTEMPTS: u32 = 50;
const OPEN_BACKOFF: Duration = Duration::from_millis(100);

pub struct SharedDirectory {
    path: PathBuf,
}

impl SharedDirectory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&StorageDirectory) -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let path = self.path.to_string_lossy();
        let mut attempt = 0;
        let storage = loop {
            attempt += 1;
            match SledStorage::new(&path) {
                Ok(storage) => break storage,
                Err(e) if attempt < OPEN_ATTEMPTS => {
                    tracing::debug!("Directory {} busy ({}), retrying", path, e);
                    std::thread::sleep(OPEN_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        };
        f(&StorageDirectory::new(Arc::new(storage)))
    }
}

impl Directory for SharedDirectory {
    fn get(&self, id: &str, kind: ParticipantKind) -> Result<Option<ParticipantDescriptor>, DirectoryError> {
        self.with_open(|dir| dir.get(id, kind))
    }

    fn list(&self, kind: ParticipantKind) -> Result<Vec<ParticipantDescriptor>, DirectoryError> {
        self.with_open(|dir| dir.list(kind))
    }

    fn put(&self, descriptor: &ParticipantDescriptor) -> Result<(), DirectoryError> {
        self.with_open(|dir| dir.put(descriptor))
    }
}
