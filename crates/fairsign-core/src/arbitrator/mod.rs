//! Arbitrator ("Trent")
//!
//! Trent is only contacted when an exchange stalls. Given the requester's
//! evidence it either recovers a signature for every party from their escrows
//! and releases all of them, or cancels the contract for everyone. The verdict
//! is decided once per contract id and content hash and cached, so every later
//! request for the same contract gets the same answer.

mod cache;

pub use cache::{VerdictCache, VerdictKey};

use crate::contract::ContractTerms;
use crate::crypto::{KeyPair, PublicKey, WrappedSignature};
use crate::messages::{
    Envelope, EscalationRequest, EvidenceItem, Payload, ReleasedSignature, SignedVerdict, Verdict,
};
use crate::transport::Transport;
use crate::types::{ContentHash, ContractId, PartyId, Stage};
use crate::{Error, Result};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Polling interval of the service loop between shutdown checks
const RECEIVE_POLL: Duration = Duration::from_millis(250);

/// Arbitrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    /// Peer id escalations are addressed to
    pub id: PartyId,
    /// Number of resolved contracts whose verdicts are kept
    pub cache_capacity: usize,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            id: "trent".to_string(),
            cache_capacity: 1024,
        }
    }
}

impl ArbitratorConfig {
    pub fn with_id(mut self, id: impl Into<PartyId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidConfig("arbitrator id must not be empty".into()));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfig("cache capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Where the arbitrator stands on one contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjudication {
    Idle,
    Adjudicating,
    Resolved,
}

pub struct Arbitrator {
    keypair: KeyPair,
    config: ArbitratorConfig,
    /// One lock per contract so adjudications never interleave
    locks: DashMap<VerdictKey, Arc<Mutex<()>>>,
    in_flight: DashSet<VerdictKey>,
    verdicts: Mutex<VerdictCache>,
}

impl Arbitrator {
    pub fn new(keypair: KeyPair, config: ArbitratorConfig) -> Result<Self> {
        config.validate()?;
        if !keypair.has_secret() {
            return Err(Error::InvalidKey("arbitrator needs its private key".into()));
        }
        let verdicts = Mutex::new(VerdictCache::new(config.cache_capacity));
        Ok(Self {
            keypair,
            config,
            locks: DashMap::new(),
            in_flight: DashSet::new(),
            verdicts,
        })
    }

    pub fn id(&self) -> &PartyId {
        &self.config.id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public()
    }

    pub async fn status(&self, contract_id: ContractId, content_hash: ContentHash) -> Adjudication {
        let key = (contract_id, content_hash);
        if self.in_flight.contains(&key) {
            Adjudication::Adjudicating
        } else if self.verdicts.lock().await.contains(&key) {
            Adjudication::Resolved
        } else {
            Adjudication::Idle
        }
    }

    /// Decide (or recall) the verdict for the contract in `request`.
    ///
    /// Verdicts are keyed by contract id and content hash, so terms made up
    /// under a real contract id never shadow the real contract. Fails with
    /// `ProtocolViolation` when `requester` is not a party or the terms name
    /// another arbitrator; nothing is cached then.
    #[instrument(skip(self, request), fields(contract_id = %request.terms.id))]
    pub async fn adjudicate(&self, request: &EscalationRequest, requester: &str) -> Result<SignedVerdict> {
        let terms = &request.terms;
        if terms.party(requester).is_none() {
            return Err(Error::ProtocolViolation(format!(
                "{} is not a party of contract {}",
                requester, terms.id
            )));
        }
        if &terms.arbitrator != self.public_key() {
            return Err(Error::ProtocolViolation(format!(
                "contract {} names another arbitrator",
                terms.id
            )));
        }
        let content_hash = terms.content_hash();
        let key = (terms.id, content_hash);

        let lock = self.locks.entry(key).or_default().clone();
        let _guard = lock.lock().await;

        if let Some(cached) = self.verdicts.lock().await.get(&key) {
            debug!("Returning cached verdict");
            return Ok(cached.clone());
        }

        self.in_flight.insert(key);
        let decided = self.decide(terms, &content_hash, &request.evidence);
        self.in_flight.remove(&key);
        let verdict = decided?;

        let evicted = self.verdicts.lock().await.insert(verdict.clone());
        for key in evicted {
            self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
        Ok(verdict)
    }

    fn decide(
        &self,
        terms: &ContractTerms,
        content_hash: &ContentHash,
        evidence: &[EvidenceItem],
    ) -> Result<SignedVerdict> {
        let verdict = match self.recover_all(terms, content_hash, evidence) {
            Ok(released) => {
                info!(contract_id = %terms.id, parties = released.len(), "Releasing signatures");
                Verdict::Release(released)
            }
            Err(Error::EscrowRecoveryFailure(reason)) => {
                info!(contract_id = %terms.id, %reason, "Cancelling contract");
                Verdict::Cancel
            }
            Err(e) => return Err(e),
        };
        SignedVerdict::sign(&self.keypair, terms.id, *content_hash, verdict)
    }

    /// Recover every party's signature or fail with `EscrowRecoveryFailure`
    fn recover_all(
        &self,
        terms: &ContractTerms,
        content_hash: &ContentHash,
        evidence: &[EvidenceItem],
    ) -> Result<Vec<ReleasedSignature>> {
        // only the claim or the last promise commit a party to the contract
        let final_promise = Stage::Promise(terms.parties.len() as u32);

        for item in evidence {
            if terms.party(&item.party).is_none() {
                warn!(party = %item.party, "Ignoring evidence from a non-party");
            }
        }

        terms
            .parties
            .iter()
            .map(|party| {
                let recovered = evidence
                    .iter()
                    .filter(|item| item.party == party.id)
                    .filter(|item| {
                        let stage = item.signature.stage();
                        stage == Stage::Claim || stage == final_promise
                    })
                    .find_map(|item| {
                        item.signature
                            .open_escrow(&self.keypair, &party.public_key, content_hash)
                    })
                    .ok_or_else(|| {
                        Error::EscrowRecoveryFailure(format!("no recoverable signature for {}", party.id))
                    })?;

                let signature =
                    WrappedSignature::resolve(&self.keypair, &party.public_key, &recovered, content_hash)?;
                Ok(ReleasedSignature {
                    party: party.id.clone(),
                    signature,
                    recovered,
                })
            })
            .collect()
    }

    /// Serve escalations arriving on `transport` until the handle shuts it down
    pub fn spawn<T>(self: Arc<Self>, transport: Arc<T>) -> ArbitratorHandle
    where
        T: Transport + ?Sized + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(arbitrator = %self.config.id, "Arbitrator listening");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = transport.receive(&self.config.id, None, RECEIVE_POLL) => match received {
                        Ok(envelope) => self.clone().dispatch(transport.clone(), envelope),
                        Err(Error::Timeout(_)) => continue,
                        Err(e) => warn!(error = %e, "Dropping undecodable message"),
                    }
                }
            }
            info!(arbitrator = %self.config.id, "Arbitrator stopped");
        });
        ArbitratorHandle { shutdown, task }
    }

    fn dispatch<T>(self: Arc<Self>, transport: Arc<T>, envelope: Envelope)
    where
        T: Transport + ?Sized + 'static,
    {
        let Envelope {
            contract_id,
            from,
            payload,
        } = envelope;
        let request = match payload {
            Payload::Escalation(request) if request.terms.id == contract_id => request,
            other => {
                warn!(from = %from, kind = other.kind(), "Ignoring unexpected message");
                return;
            }
        };

        tokio::spawn(async move {
            let verdict = match self.adjudicate(&request, &from).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(contract_id = %contract_id, from = %from, error = %e, "Escalation rejected");
                    return;
                }
            };

            let reply = Envelope::new(contract_id, self.config.id.clone(), Payload::Verdict(verdict));
            for party in &request.terms.parties {
                if let Err(e) = transport.send(&party.id, &reply).await {
                    warn!(party = %party.id, error = %e, "Could not deliver verdict");
                }
            }
        });
    }
}

/// Running arbitrator service
pub struct ArbitratorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ArbitratorHandle {
    /// Stop the service loop and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Contract, Party};
    use crate::transport::MemoryTransport;
    use uuid::Uuid;

    struct Setup {
        trent: KeyPair,
        keys: Vec<KeyPair>,
        contract: Contract,
    }

    fn setup(n: usize) -> Setup {
        setup_with(n, KeyPair::generate())
    }

    fn setup_with(n: usize, trent: KeyPair) -> Setup {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let parties = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Party::new(format!("p{}", i), *k.public()))
            .collect();
        Setup {
            contract: Contract::draft(vec!["pay 5 coins".into()], parties, *trent.public()).unwrap(),
            trent,
            keys,
        }
    }

    fn key(setup: &Setup) -> VerdictKey {
        (setup.contract.id(), *setup.contract.content_hash())
    }

    fn arbitrator(setup: &Setup, capacity: usize) -> Arbitrator {
        Arbitrator::new(
            setup.trent.clone(),
            ArbitratorConfig::default().with_cache_capacity(capacity),
        )
        .unwrap()
    }

    fn evidence(setup: &Setup, stage: Stage) -> Vec<EvidenceItem> {
        setup
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| EvidenceItem {
                party: format!("p{}", i),
                signature: WrappedSignature::sign(k, setup.trent.public(), setup.contract.content_hash(), stage)
                    .unwrap(),
            })
            .collect()
    }

    fn request(setup: &Setup, evidence: Vec<EvidenceItem>) -> EscalationRequest {
        EscalationRequest {
            terms: setup.contract.terms().clone(),
            evidence,
        }
    }

    #[tokio::test]
    async fn test_release_from_final_promises() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let verdict = trent
            .adjudicate(&request(&s, evidence(&s, Stage::Promise(2))), "p0")
            .await
            .unwrap();

        assert!(verdict.verify(s.trent.public()));
        let released = match verdict.verdict {
            Verdict::Release(released) => released,
            Verdict::Cancel => panic!("expected release"),
        };
        assert_eq!(released.len(), 2);

        let mut contract = s.contract.clone();
        for item in released {
            let key = contract.terms().party(&item.party).unwrap().public_key;
            assert!(item.recovered.verify(&key, contract.content_hash()));
            contract.add_signature(Some(&key), item.signature).unwrap();
        }
        assert!(contract.is_finalized());
    }

    #[tokio::test]
    async fn test_cancel_on_early_promises() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let mut items = evidence(&s, Stage::Claim);
        items[1] = evidence(&s, Stage::Promise(1)).remove(1);

        let verdict = trent.adjudicate(&request(&s, items), "p0").await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Cancel);
        assert!(verdict.verify(s.trent.public()));
    }

    #[tokio::test]
    async fn test_requester_behind_final_round_cancels() {
        // p1 stopped after round 1 and holds p0's last promise
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let mut items = evidence(&s, Stage::Promise(2));
        items[1] = evidence(&s, Stage::Promise(1)).remove(1);

        let verdict = trent.adjudicate(&request(&s, items), "p1").await.unwrap();
        assert!(verdict.verdict.is_cancel());
    }

    #[tokio::test]
    async fn test_cancel_on_missing_evidence() {
        let s = setup(3);
        let trent = arbitrator(&s, 8);
        let mut items = evidence(&s, Stage::Claim);
        items.pop();

        let verdict = trent.adjudicate(&request(&s, items), "p1").await.unwrap();
        assert!(verdict.verdict.is_cancel());
    }

    #[tokio::test]
    async fn test_escrow_for_another_arbitrator_is_not_recoverable() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let other = KeyPair::generate();
        let items = s
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| EvidenceItem {
                party: format!("p{}", i),
                signature: WrappedSignature::sign(k, other.public(), s.contract.content_hash(), Stage::Claim)
                    .unwrap(),
            })
            .collect();

        let verdict = trent.adjudicate(&request(&s, items), "p0").await.unwrap();
        assert!(verdict.verdict.is_cancel());
    }

    #[tokio::test]
    async fn test_idempotent_adjudication() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let (id, hash) = key(&s);
        assert_eq!(trent.status(id, hash).await, Adjudication::Idle);

        let req = request(&s, evidence(&s, Stage::Promise(1)));
        let first = trent.adjudicate(&req, "p0").await.unwrap();
        let second = trent.adjudicate(&req, "p0").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(trent.status(id, hash).await, Adjudication::Resolved);

        // better evidence later does not overturn the cancellation
        let third = trent
            .adjudicate(&request(&s, evidence(&s, Stage::Claim)), "p1")
            .await
            .unwrap();
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_one_verdict() {
        let s = setup(2);
        let trent = Arc::new(arbitrator(&s, 8));
        let req = request(&s, evidence(&s, Stage::Claim));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let trent = trent.clone();
                let req = req.clone();
                tokio::spawn(async move { trent.adjudicate(&req, &format!("p{}", i % 2)).await })
            })
            .collect();

        let mut verdicts = Vec::new();
        for task in tasks {
            verdicts.push(task.await.unwrap().unwrap());
        }
        assert!(verdicts.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_rejects_non_party_requester() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);
        let result = trent
            .adjudicate(&request(&s, evidence(&s, Stage::Claim)), "mallory")
            .await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        let (id, hash) = key(&s);
        assert_eq!(trent.status(id, hash).await, Adjudication::Idle);
    }

    #[tokio::test]
    async fn test_rejects_terms_naming_another_arbitrator() {
        let s = setup(2);
        let trent = Arbitrator::new(KeyPair::generate(), ArbitratorConfig::default()).unwrap();
        let result = trent
            .adjudicate(&request(&s, evidence(&s, Stage::Claim)), "p0")
            .await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        let (id, hash) = key(&s);
        assert_eq!(trent.status(id, hash).await, Adjudication::Idle);
    }

    #[tokio::test]
    async fn test_made_up_terms_do_not_shadow_contract() {
        let s = setup(2);
        let trent = arbitrator(&s, 8);

        // p1 escalates first, under the real id but with other clauses
        let mut made_up = request(&s, Vec::new());
        made_up.terms.clauses.push("and a pony".into());
        let early = trent.adjudicate(&made_up, "p1").await.unwrap();
        assert!(early.verdict.is_cancel());

        let real = trent
            .adjudicate(&request(&s, evidence(&s, Stage::Claim)), "p0")
            .await
            .unwrap();
        assert!(!real.verdict.is_cancel());
        assert_eq!(&real.content_hash, s.contract.content_hash());

        let (id, hash) = key(&s);
        assert_eq!(trent.status(id, hash).await, Adjudication::Resolved);
        assert_eq!(trent.status(id, made_up.terms.content_hash()).await, Adjudication::Resolved);
    }

    #[tokio::test]
    async fn test_cache_eviction() {
        let trent_key = KeyPair::generate();
        let trent = Arbitrator::new(trent_key.clone(), ArbitratorConfig::default().with_cache_capacity(2)).unwrap();

        let mut keys = Vec::new();
        for _ in 0..3 {
            let s = setup_with(2, trent_key.clone());
            trent
                .adjudicate(&request(&s, evidence(&s, Stage::Claim)), "p0")
                .await
                .unwrap();
            keys.push(key(&s));
        }

        assert_eq!(trent.status(keys[0].0, keys[0].1).await, Adjudication::Idle);
        assert_eq!(trent.status(keys[1].0, keys[1].1).await, Adjudication::Resolved);
        assert_eq!(trent.status(keys[2].0, keys[2].1).await, Adjudication::Resolved);
        assert!(!trent.locks.contains_key(&keys[0]));
    }

    #[test]
    fn test_config_validation() {
        assert!(ArbitratorConfig::default().validate().is_ok());
        assert!(ArbitratorConfig::default().with_cache_capacity(0).validate().is_err());
        assert!(ArbitratorConfig::default().with_id("").validate().is_err());
        assert!(matches!(
            Arbitrator::new(KeyPair::generate().public_only(), ArbitratorConfig::default()),
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_service_answers_every_party() {
        let s = setup(2);
        let transport = Arc::new(MemoryTransport::new());
        let service = Arc::new(arbitrator(&s, 8)).spawn(transport.clone());

        let req = request(&s, evidence(&s, Stage::Claim));
        let escalation = Envelope::new(s.contract.id(), "p1", Payload::Escalation(req));
        transport.send(&"trent".to_string(), &escalation).await.unwrap();

        for party in ["p0", "p1"] {
            let envelope = transport
                .receive(&party.to_string(), Some(&s.contract.id()), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(envelope.from, "trent");
            match envelope.payload {
                Payload::Verdict(verdict) => assert!(!verdict.verdict.is_cancel()),
                other => panic!("unexpected {}", other.kind()),
            }
        }
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_ignores_mismatched_envelope() {
        let s = setup(2);
        let transport = Arc::new(MemoryTransport::new());
        let service = Arc::new(arbitrator(&s, 8)).spawn(transport.clone());

        let req = request(&s, evidence(&s, Stage::Claim));
        let escalation = Envelope::new(Uuid::new_v4(), "p1", Payload::Escalation(req));
        transport.send(&"trent".to_string(), &escalation).await.unwrap();

        let reply = transport
            .receive(&"p0".to_string(), None, Duration::from_millis(500))
            .await;
        assert!(matches!(reply, Err(Error::Timeout(_))));
        service.shutdown().await.unwrap();
    }
}
