//! Persistence collaborator
//!
//! The core only needs a synchronous key-value store: entities are written as
//! JSON under `(kind, id)` and read back by the same pair. Party keys are
//! resolved through the [`KeyDirectory`] view of the same store.

use crate::contract::Party;
use crate::crypto::PublicKey;
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// In-memory store for tests and the CLI
pub mod memory;

pub use memory::MemoryStore;

/// Namespace of a stored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Party,
    Contract,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Party => f.write_str("party"),
            EntityKind::Contract => f.write_str("contract"),
        }
    }
}

/// Something that can be stored
pub trait Entity: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    /// Identifier within [`Self::KIND`]
    fn key(&self) -> String;
}

/// Raw key-value storage
pub trait Persistence: Send + Sync {
    /// `Ok(None)` when nothing is stored under the key
    fn get_raw(&self, kind: EntityKind, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store or replace a value
    fn put_raw(&self, kind: EntityKind, id: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Typed access on top of [`Persistence`]
pub trait PersistenceExt: Persistence {
    fn get<E: Entity>(&self, id: &str) -> Result<E> {
        let bytes = self
            .get_raw(E::KIND, id)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", E::KIND, id)))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn put<E: Entity>(&self, entity: &E) -> Result<()> {
        let bytes = serde_json::to_vec(entity)?;
        self.put_raw(E::KIND, &entity.key(), bytes)
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}

/// Resolves a party id to its public key
pub trait KeyDirectory {
    fn resolve(&self, party: &str) -> Result<PublicKey>;
}

impl<P: Persistence + ?Sized> KeyDirectory for P {
    fn resolve(&self, party: &str) -> Result<PublicKey> {
        let entry: Party = self.get(party)?;
        Ok(entry.public_key)
    }
}
