//! Contract aggregate
//!
//! Holds the clauses and parties a contract is about, the wrapped signatures
//! collected so far, the local party's wish and the shared status. The status
//! is `Finalized` exactly when every party has a verifying signature;
//! `Cancelled` and `Finalized` are terminal.

mod entity;

pub use entity::ContractEntity;

use crate::crypto::{KeyPair, PublicKey, WrappedSignature};
use crate::persistence::{Entity, EntityKind, KeyDirectory};
use crate::types::{ContentHash, ContractId, PartyId, Stage, Status, Wish};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// A participant: identifier plus public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub public_key: PublicKey,
}

impl Party {
    pub fn new(id: impl Into<PartyId>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            public_key,
        }
    }
}

impl Entity for Party {
    const KIND: EntityKind = EntityKind::Party;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// The public data every party (and the arbitrator) agrees on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    pub id: ContractId,
    pub clauses: Vec<String>,
    pub parties: Vec<Party>,
    /// Escrow key every wrapped signature on this contract must use
    pub arbitrator: PublicKey,
}

impl ContractTerms {
    /// Validate that party ids and keys are unique and that the arbitrator
    /// is not one of the parties
    pub fn new(id: ContractId, clauses: Vec<String>, parties: Vec<Party>, arbitrator: PublicKey) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        keys.insert(arbitrator.to_bytes());
        for party in &parties {
            if !ids.insert(party.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate party id {}", party.id)));
            }
            if !keys.insert(party.public_key.to_bytes()) {
                return Err(Error::InvalidKey(format!(
                    "party {} reuses another party's or the arbitrator's key",
                    party.id
                )));
            }
        }
        Ok(Self {
            id,
            clauses,
            parties,
            arbitrator,
        })
    }

    /// Digest of the ordered clauses, the ordered party list and the
    /// arbitrator's key
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(b"fairsign/contract/v1");
        hasher.update((self.clauses.len() as u64).to_be_bytes());
        for clause in &self.clauses {
            hasher.update((clause.len() as u64).to_be_bytes());
            hasher.update(clause.as_bytes());
        }
        hasher.update((self.parties.len() as u64).to_be_bytes());
        for party in &self.parties {
            hasher.update((party.id.len() as u64).to_be_bytes());
            hasher.update(party.id.as_bytes());
            hasher.update(party.public_key.to_bytes());
        }
        hasher.update(self.arbitrator.to_bytes());
        hasher.finalize().into()
    }

    pub fn party(&self, id: &str) -> Option<&Party> {
        self.parties.iter().find(|p| p.id == id)
    }

    pub fn party_by_key(&self, key: &PublicKey) -> Option<&Party> {
        self.parties.iter().find(|p| &p.public_key == key)
    }

    pub fn party_ids(&self) -> Vec<PartyId> {
        self.parties.iter().map(|p| p.id.clone()).collect()
    }
}

/// A party's local copy of a contract
#[derive(Debug, Clone)]
pub struct Contract {
    terms: ContractTerms,
    content_hash: ContentHash,
    signatures: BTreeMap<PartyId, WrappedSignature>,
    wish: Wish,
    status: Status,
    created_at: DateTime<Utc>,
}

impl Contract {
    pub fn new(terms: ContractTerms) -> Self {
        let content_hash = terms.content_hash();
        Self {
            terms,
            content_hash,
            signatures: BTreeMap::new(),
            wish: Wish::Unset,
            status: Status::Nowhere,
            created_at: Utc::now(),
        }
    }

    /// New contract with a random id
    pub fn draft(clauses: Vec<String>, parties: Vec<Party>, arbitrator: PublicKey) -> Result<Self> {
        Ok(Self::new(ContractTerms::new(Uuid::new_v4(), clauses, parties, arbitrator)?))
    }

    /// Rebuild from a persisted record, resolving party keys and re-checking signatures
    pub fn from_entity<D: KeyDirectory + ?Sized>(entity: &ContractEntity, directory: &D) -> Result<Self> {
        let parties = entity
            .parties
            .iter()
            .map(|id| Ok(Party::new(id.clone(), directory.resolve(id)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut contract = Self::new(ContractTerms::new(
            entity.id,
            entity.clauses.clone(),
            parties,
            entity.arbitrator,
        )?);
        contract.wish = entity.wish;
        contract.created_at = entity.created_at;

        for (party_id, signature) in &entity.signatures {
            let key = contract
                .terms
                .party(party_id)
                .map(|p| p.public_key)
                .ok_or_else(|| Error::InvalidKey(format!("signature from unlisted party {}", party_id)))?;
            contract.add_signature(Some(&key), signature.clone())?;
        }

        if entity.status == Status::Cancelled && !contract.is_finalized() {
            contract.status = Status::Cancelled;
        } else if entity.status == Status::Pending && contract.status == Status::Nowhere {
            contract.status = Status::Pending;
        }
        Ok(contract)
    }

    /// Persisted form
    pub fn to_entity(&self) -> ContractEntity {
        ContractEntity {
            id: self.terms.id,
            clauses: self.terms.clauses.clone(),
            parties: self.terms.party_ids(),
            arbitrator: self.terms.arbitrator,
            signatures: self.signatures.clone(),
            wish: self.wish,
            status: self.status,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ContractId {
        self.terms.id
    }

    pub fn terms(&self) -> &ContractTerms {
        &self.terms
    }

    pub fn clauses(&self) -> &[String] {
        &self.terms.clauses
    }

    pub fn parties(&self) -> &[Party] {
        &self.terms.parties
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn arbitrator(&self) -> &PublicKey {
        &self.terms.arbitrator
    }

    pub fn signatures(&self) -> &BTreeMap<PartyId, WrappedSignature> {
        &self.signatures
    }

    pub fn has_signature(&self, party: &str) -> bool {
        self.signatures.contains_key(party)
    }

    fn listed_signer(&self, signer: &KeyPair) -> Result<()> {
        if self.terms.party_by_key(signer.public()).is_none() {
            return Err(Error::InvalidKey("invalid key: signer is not a party".into()));
        }
        Ok(())
    }

    /// The signer's claim: a wrapped signature over the contract content
    pub fn sign(&self, signer: &KeyPair) -> Result<WrappedSignature> {
        self.listed_signer(signer)?;
        WrappedSignature::sign(signer, &self.terms.arbitrator, &self.content_hash, Stage::Claim)
    }

    /// A promise for exchange round `round`
    pub fn promise(&self, signer: &KeyPair, round: u32) -> Result<WrappedSignature> {
        self.listed_signer(signer)?;
        WrappedSignature::sign(signer, &self.terms.arbitrator, &self.content_hash, Stage::Promise(round))
    }

    /// Valid for `key` and escrowed to this contract's arbitrator
    fn binds(&self, key: &PublicKey, signature: &WrappedSignature) -> bool {
        signature.trent_key() == &self.terms.arbitrator && signature.verify(key, &self.content_hash)
    }

    /// Check a signature received from `party` for the given stage
    pub fn verify_from(&self, party: &str, stage: Stage, signature: &WrappedSignature) -> Result<()> {
        let key = self
            .terms
            .party(party)
            .map(|p| p.public_key)
            .ok_or_else(|| Error::InvalidKey(format!("invalid key: {} is not a party", party)))?;
        if signature.stage() != stage {
            return Err(Error::InvalidProof(format!(
                "signature from {} is bound to {}, expected {}",
                party,
                signature.stage(),
                stage
            )));
        }
        if signature.trent_key() != &self.terms.arbitrator {
            return Err(Error::InvalidProof(format!(
                "signature from {} is escrowed to a foreign key",
                party
            )));
        }
        if !signature.verify(&key, &self.content_hash) {
            return Err(Error::InvalidProof(format!("signature from {} does not verify", party)));
        }
        Ok(())
    }

    /// Install a party's claim after verifying it.
    ///
    /// Fails with `InvalidKey` when `party_key` is absent or not listed and
    /// with `InvalidProof` when the signature does not verify; neither
    /// failure changes the contract.
    pub fn add_signature(&mut self, party_key: Option<&PublicKey>, signature: WrappedSignature) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::ProtocolViolation(format!(
                "contract {} is already {:?}",
                self.terms.id, self.status
            )));
        }

        let key = party_key.ok_or_else(|| Error::InvalidKey("invalid key: none supplied".into()))?;
        let party_id = self
            .terms
            .party_by_key(key)
            .map(|p| p.id.clone())
            .ok_or_else(|| Error::InvalidKey("invalid key: not a party of this contract".into()))?;

        self.verify_from(&party_id, Stage::Claim, &signature)?;

        debug!(contract_id = %self.terms.id, party = %party_id, "Signature added");
        self.signatures.insert(party_id, signature);
        self.refresh_status();
        Ok(())
    }

    fn refresh_status(&mut self) {
        if self.is_finalized() {
            self.status = Status::Finalized;
        } else if self.status == Status::Nowhere && !self.signatures.is_empty() {
            self.status = Status::Pending;
        }
    }

    /// Every listed party has a verified signature
    pub fn is_finalized(&self) -> bool {
        !self.terms.parties.is_empty()
            && self
                .terms
                .parties
                .iter()
                .all(|p| self.signatures.contains_key(&p.id))
    }

    /// Whether `other` is a complete, fully verifying copy of this agreement.
    ///
    /// Clauses, parties and arbitrator must match, `other` must hold a verifying claim from
    /// every party and every claim held here must verify too.
    pub fn check_contract(&self, other: &Contract) -> bool {
        if self.terms.clauses != other.terms.clauses
            || self.terms.parties != other.terms.parties
            || self.terms.arbitrator != other.terms.arbitrator
        {
            return false;
        }

        let verifies = |party: &Party, sig: Option<&WrappedSignature>| {
            sig.map_or(false, |s| s.stage() == Stage::Claim && self.binds(&party.public_key, s))
        };

        let other_complete = !self.terms.parties.is_empty()
            && self
                .terms
                .parties
                .iter()
                .all(|p| verifies(p, other.signatures.get(&p.id)));
        let own_valid = self
            .signatures
            .iter()
            .all(|(id, sig)| self.terms.party(id).map_or(false, |p| verifies(p, Some(sig))));

        other_complete && own_valid
    }

    pub fn wish(&self) -> Wish {
        self.wish
    }

    pub fn set_wish(&mut self, wish: Wish) {
        self.wish = wish;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Change the status, refusing to leave a terminal state or to claim
    /// finalization without every signature
    pub fn set_status(&mut self, status: Status) -> Result<()> {
        if status == self.status {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(Error::ProtocolViolation(format!(
                "contract {} is already {:?}",
                self.terms.id, self.status
            )));
        }
        if status == Status::Finalized && !self.is_finalized() {
            return Err(Error::ProtocolViolation(
                "cannot finalize while signatures are missing".into(),
            ));
        }
        self.status = status;
        Ok(())
    }
}
