//! Persisted form of a contract

use crate::crypto::{PublicKey, WrappedSignature};
use crate::persistence::{Entity, EntityKind};
use crate::types::{ContractId, PartyId, Status, Wish};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Contract record as stored by the persistence collaborator.
///
/// Parties are referenced by id; their keys are resolved through a
/// [`KeyDirectory`](crate::persistence::KeyDirectory) when the aggregate is
/// rebuilt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractEntity {
    pub id: ContractId,
    pub clauses: Vec<String>,
    pub parties: Vec<PartyId>,
    pub arbitrator: PublicKey,
    pub signatures: BTreeMap<PartyId, WrappedSignature>,
    pub wish: Wish,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContractEntity {
    /// New unsigned contract with a random id
    pub fn new(clauses: Vec<String>, parties: Vec<PartyId>, arbitrator: PublicKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            clauses,
            parties,
            arbitrator,
            signatures: BTreeMap::new(),
            wish: Wish::Unset,
            status: Status::Nowhere,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for ContractEntity {
    const KIND: EntityKind = EntityKind::Contract;

    fn key(&self) -> String {
        self.id.to_string()
    }
}
