use super::{EntityKind, Persistence};
use crate::Result;
use dashmap::DashMap;

/// DashMap-backed [`Persistence`]
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(EntityKind, String), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities across all kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Persistence for MemoryStore {
    fn get_raw(&self, kind: EntityKind, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(kind, id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn put_raw(&self, kind: EntityKind, id: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.insert((kind, id.to_string()), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Party;
    use crate::crypto::KeyPair;
    use crate::persistence::{KeyDirectory, PersistenceExt};
    use crate::Error;

    #[test]
    fn test_put_get_party() {
        let store = MemoryStore::new();
        let key = KeyPair::generate();
        store.put(&Party::new("alice", *key.public())).unwrap();

        let party: Party = store.get("alice").unwrap();
        assert_eq!(party.public_key, *key.public());
        assert_eq!(store.resolve("alice").unwrap(), *key.public());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_entity() {
        let store = MemoryStore::new();
        assert!(matches!(store.resolve("bob"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_kinds_are_separate() {
        let store = MemoryStore::new();
        store.put_raw(EntityKind::Contract, "alice", b"{}".to_vec()).unwrap();
        assert!(store.get_raw(EntityKind::Party, "alice").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry() {
        let store = MemoryStore::new();
        store.put_raw(EntityKind::Party, "alice", b"not json".to_vec()).unwrap();
        assert!(matches!(store.resolve("alice"), Err(Error::Deserialization(_))));
    }
}
