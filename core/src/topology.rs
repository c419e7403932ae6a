// Network topology: immutable snapshots of the published participants
//
// Readers clone the current `Arc<Topology>`; a refresh builds a new snapshot
// from the directory without holding the lock and swaps it in.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::descriptor::{ParticipantDescriptor, ParticipantKind};
use crate::store::{Directory, DirectoryError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub mixes: Vec<ParticipantDescriptor>,
    pub providers: Vec<ParticipantDescriptor>,
    pub clients: Vec<ParticipantDescriptor>,
}

impl Topology {
    pub fn new(
        mixes: Vec<ParticipantDescriptor>,
        providers: Vec<ParticipantDescriptor>,
        clients: Vec<ParticipantDescriptor>,
    ) -> Self {
        Self {
            mixes,
            providers,
            clients,
        }
    }

    /// Snapshot of everything currently in the directory
    pub fn load(directory: &dyn Directory) -> Result<Self, DirectoryError> {
        Ok(Self {
            mixes: directory.list(ParticipantKind::Mix)?,
            providers: directory.list(ParticipantKind::Provider)?,
            clients: directory.list(ParticipantKind::Client)?,
        })
    }

    pub fn provider(&self, id: &str) -> Option<&ParticipantDescriptor> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn client(&self, id: &str) -> Option<&ParticipantDescriptor> {
        self.clients.iter().find(|c| c.id == id)
    }
}

/// Shared, swappable view of the current topology
#[derive(Clone, Default)]
pub struct TopologyHandle {
    current: Arc<RwLock<Arc<Topology>>>,
}

impl TopologyHandle {
    pub fn new(topology: Topology) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(topology))),
        }
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        self.current.read().clone()
    }

    pub fn replace(&self, topology: Topology) {
        *self.current.write() = Arc::new(topology);
    }

    /// Reload from `directory`; the previous snapshot stays in place on error
    pub fn refresh(&self, directory: &dyn Directory) -> Result<(), DirectoryError> {
        let topology = Topology::load(directory)?;
        self.replace(topology);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, StorageDirectory};

    #[test]
    fn test_refresh_swaps_snapshot() {
        let directory = StorageDirectory::new(Arc::new(MemoryStorage::new()));
        let handle = TopologyHandle::default();
        let before = handle.snapshot();
        assert!(before.mixes.is_empty());

        directory
            .put(&ParticipantDescriptor::new("m1", ParticipantKind::Mix, "h", "1", [1; 32]))
            .unwrap();
        directory
            .put(&ParticipantDescriptor::new("p1", ParticipantKind::Provider, "h", "2", [2; 32]))
            .unwrap();
        handle.refresh(&directory).unwrap();

        let after = handle.snapshot();
        assert_eq!(after.mixes.len(), 1);
        assert!(after.provider("p1").is_some());
        // Readers holding the old snapshot are unaffected
        assert!(before.mixes.is_empty());
    }

    #[test]
    fn test_client_lookup() {
        let alice = ParticipantDescriptor::new("alice", ParticipantKind::Client, "h", "3", [4; 32]).with_provider("p1");
        let topology = Topology::new(vec![], vec![], vec![alice.clone()]);
        assert_eq!(topology.client("alice"), Some(&alice));
        assert_eq!(topology.client("bob"), None);
    }
}
