//! Protocol messages exchanged between parties and the arbitrator

use crate::contract::ContractTerms;
use crate::crypto::{KeyPair, PublicKey, SchnorrSignature, WrappedSignature};
use crate::types::{ContentHash, ContractId, PartyId, Stage};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Addressed unit on the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub contract_id: ContractId,
    pub from: PartyId,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(contract_id: ContractId, from: impl Into<PartyId>, payload: Payload) -> Self {
        Self {
            contract_id,
            from: from.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// A promise or the claim of the sender
    Signature {
        stage: Stage,
        signature: WrappedSignature,
    },
    /// Sender holds every party's claim
    AcknowledgeComplete,
    /// Party asks the arbitrator to resolve the contract
    Escalation(EscalationRequest),
    /// Arbitrator decision, possibly forwarded by a peer
    Verdict(SignedVerdict),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Signature { .. } => "signature",
            Payload::AcknowledgeComplete => "ack",
            Payload::Escalation(_) => "escalation",
            Payload::Verdict(_) => "verdict",
        }
    }
}

/// Best signature the requester holds from one party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub party: PartyId,
    pub signature: WrappedSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub terms: ContractTerms,
    pub evidence: Vec<EvidenceItem>,
}

/// A signature recovered and re-wrapped by the arbitrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedSignature {
    pub party: PartyId,
    pub signature: WrappedSignature,
    pub recovered: SchnorrSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Release(Vec<ReleasedSignature>),
    Cancel,
}

impl Verdict {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Verdict::Cancel)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Verdict::Cancel => out.push(0x00),
            Verdict::Release(released) => {
                out.push(0x01);
                out.extend_from_slice(&(released.len() as u32).to_be_bytes());
                for item in released {
                    let signature = item.signature.to_bytes();
                    out.extend_from_slice(&(item.party.len() as u32).to_be_bytes());
                    out.extend_from_slice(item.party.as_bytes());
                    out.extend_from_slice(&(signature.len() as u32).to_be_bytes());
                    out.extend_from_slice(&signature);
                    out.extend_from_slice(&item.recovered.to_bytes());
                }
            }
        }
    }
}

/// Verdict signed by the arbitrator so it can be forwarded between parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVerdict {
    pub contract_id: ContractId,
    pub content_hash: ContentHash,
    pub verdict: Verdict,
    pub signature: SchnorrSignature,
}

fn verdict_message(contract_id: &ContractId, content_hash: &ContentHash, verdict: &Verdict) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"fairsign/verdict/v1");
    message.extend_from_slice(contract_id.as_bytes());
    message.extend_from_slice(content_hash);
    verdict.encode(&mut message);
    message
}

impl SignedVerdict {
    pub fn sign(
        trent: &KeyPair,
        contract_id: ContractId,
        content_hash: ContentHash,
        verdict: Verdict,
    ) -> Result<Self> {
        let signature = SchnorrSignature::sign(trent, &verdict_message(&contract_id, &content_hash, &verdict))?;
        Ok(Self {
            contract_id,
            content_hash,
            verdict,
            signature,
        })
    }

    pub fn verify(&self, trent_key: &PublicKey) -> bool {
        self.signature.verify(
            trent_key,
            &verdict_message(&self.contract_id, &self.content_hash, &self.verdict),
        )
    }
}
