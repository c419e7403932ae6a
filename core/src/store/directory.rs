// Participant directory: published descriptors of mixes, providers and clients
//
// Records live under `pki/<kind>/<id>` as bincode-encoded descriptors.

use std::sync::Arc;
use thiserror::Error;

use super::backend::{StorageBackend, StorageError};
use crate::descriptor::{ParticipantDescriptor, ParticipantKind};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupt directory record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub trait Directory: Send + Sync {
    fn get(&self, id: &str, kind: ParticipantKind) -> Result<Option<ParticipantDescriptor>, DirectoryError>;
    fn list(&self, kind: ParticipantKind) -> Result<Vec<ParticipantDescriptor>, DirectoryError>;
    fn put(&self, descriptor: &ParticipantDescriptor) -> Result<(), DirectoryError>;
}

/// Directory stored in a `StorageBackend`
pub struct StorageDirectory {
    backend: Arc<dyn StorageBackend>,
}

impl StorageDirectory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn prefix(kind: ParticipantKind) -> String {
        format!("pki/{}/", kind.as_str())
    }

    fn key(kind: ParticipantKind, id: &str) -> String {
        format!("{}{}", Self::prefix(kind), id)
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<ParticipantDescriptor, DirectoryError> {
        bincode::deserialize(value).map_err(|e| DirectoryError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }
}

impl Directory for StorageDirectory {
    fn get(&self, id: &str, kind: ParticipantKind) -> Result<Option<ParticipantDescriptor>, DirectoryError> {
        let key = Self::key(kind, id);
        match self.backend.get(key.as_bytes())? {
            Some(value) => Ok(Some(Self::decode(key.as_bytes(), &value)?)),
            None => Ok(None),
        }
    }

    fn list(&self, kind: ParticipantKind) -> Result<Vec<ParticipantDescriptor>, DirectoryError> {
        let mut descriptors = self
            .backend
            .scan_prefix(Self::prefix(kind).as_bytes())?
            .iter()
            .map(|(k, v)| Self::decode(k, v))
            .collect::<Result<Vec<_>, _>>()?;
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(descriptors)
    }

    fn put(&self, descriptor: &ParticipantDescriptor) -> Result<(), DirectoryError> {
        let key = Self::key(descriptor.kind, &descriptor.id);
        let value = bincode::serialize(descriptor).map_err(|e| DirectoryError::Serialization(e.to_string()))?;
        self.backend.put(key.as_bytes(), &value)?;
        self.backend.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{MemoryStorage, SledStorage};

    fn descriptor(id: &str, kind: ParticipantKind) -> ParticipantDescriptor {
        ParticipantDescriptor::new(id, kind, "127.0.0.1", "9000", [3; 32])
    }

    #[test]
    fn test_put_get_list() {
        let dir = StorageDirectory::new(Arc::new(MemoryStorage::new()));
        dir.put(&descriptor("m2", ParticipantKind::Mix)).unwrap();
        dir.put(&descriptor("m1", ParticipantKind::Mix)).unwrap();
        dir.put(&descriptor("p1", ParticipantKind::Provider)).unwrap();
        dir.put(&descriptor("alice", ParticipantKind::Client).with_provider("p1")).unwrap();

        let mixes = dir.list(ParticipantKind::Mix).unwrap();
        assert_eq!(mixes.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert_eq!(dir.list(ParticipantKind::Provider).unwrap().len(), 1);

        let alice = dir.get("alice", ParticipantKind::Client).unwrap().unwrap();
        assert_eq!(alice.provider.as_deref(), Some("p1"));
        assert!(dir.get("alice", ParticipantKind::Mix).unwrap().is_none());
    }

    #[test]
    fn test_put_replaces() {
        let dir = StorageDirectory::new(Arc::new(MemoryStorage::new()));
        dir.put(&descriptor("m1", ParticipantKind::Mix)).unwrap();
        dir.put(&descriptor("m1", ParticipantKind::Mix).with_layer(2)).unwrap();
        let mixes = dir.list(ParticipantKind::Mix).unwrap();
        assert_eq!(mixes.len(), 1);
        assert_eq!(mixes[0].layer, Some(2));
    }

    #[test]
    fn test_corrupt_record() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(b"pki/mix/bad", b"\x01").unwrap();
        let dir = StorageDirectory::new(storage);
        assert!(matches!(dir.list(ParticipantKind::Mix), Err(DirectoryError::Corrupt { .. })));
    }

    #[test]
    fn test_sled_directory_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pki");
        let path = path.to_str().unwrap();
        {
            let dir = StorageDirectory::new(Arc::new(SledStorage::new(path).unwrap()));
            dir.put(&descriptor("m1", ParticipantKind::Mix)).unwrap();
        }
        let dir = StorageDirectory::new(Arc::new(SledStorage::new(path).unwrap()));
        assert_eq!(dir.list(ParticipantKind::Mix).unwrap().len(), 1);
    }
}
