//! Run loop of a started establisher

use super::{Conduct, EstablisherConfig, EstablisherState};
use crate::contract::Contract;
use crate::crypto::{KeyPair, PublicKey, WrappedSignature};
use crate::messages::{Envelope, EscalationRequest, EvidenceItem, Payload, SignedVerdict, Verdict};
use crate::persistence::{Persistence, PersistenceExt};
use crate::transport::Transport;
use crate::types::{PartyId, Stage, Status};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Who the session acts as, and who it escalates to
pub(super) struct Identity {
    pub me: PartyId,
    pub keypair: KeyPair,
    pub trent_id: PartyId,
    pub trent_key: PublicKey,
}

/// Why a wait ended
enum Wait {
    Ready,
    TimedOut,
    Misbehaviour(String),
    Verdict(SignedVerdict),
}

pub(super) struct Session<T: Transport + ?Sized> {
    identity: Identity,
    transport: Arc<T>,
    config: EstablisherConfig,
    persistence: Option<Arc<dyn Persistence>>,
    contract: Contract,
    peers: Vec<PartyId>,
    /// Verified signatures per peer and stage
    held: HashMap<PartyId, BTreeMap<Stage, WrappedSignature>>,
    acks: HashSet<PartyId>,
    claim: Option<WrappedSignature>,
    /// Last signature actually published, the only own evidence for Trent
    sent: Option<WrappedSignature>,
    state: watch::Sender<EstablisherState>,
}

impl<T: Transport + ?Sized> Session<T> {
    pub(super) fn new(
        identity: Identity,
        transport: Arc<T>,
        config: EstablisherConfig,
        persistence: Option<Arc<dyn Persistence>>,
        contract: Contract,
        state: watch::Sender<EstablisherState>,
    ) -> Self {
        let peers = contract
            .parties()
            .iter()
            .filter(|p| p.id != identity.me)
            .map(|p| p.id.clone())
            .collect();
        Self {
            identity,
            transport,
            config,
            persistence,
            contract,
            peers,
            held: HashMap::new(),
            acks: HashSet::new(),
            claim: None,
            sent: None,
            state,
        }
    }

    #[instrument(skip(self), fields(party = %self.identity.me, contract_id = %self.contract.id()))]
    pub(super) async fn run(mut self) -> Result<Contract> {
        let outcome = self.exchange().await;
        let persisted = self.persist();
        outcome?;
        persisted?;
        Ok(self.contract)
    }

    async fn exchange(&mut self) -> Result<()> {
        self.set_state(EstablisherState::Exchanging);
        let rounds = self.rounds();

        for round in 1..=rounds {
            let stage = Stage::Promise(round);
            if !self.sends(stage) {
                return self.stay_silent().await;
            }
            let promise = self.contract.promise(&self.identity.keypair, round)?;
            self.publish(stage, promise).await;

            match self.collect(stage).await? {
                Wait::Ready => debug!(round, "Promises collected"),
                other => return self.divert(other, stage).await,
            }
        }

        if !self.sends(Stage::Claim) {
            return self.stay_silent().await;
        }
        let claim = self.contract.sign(&self.identity.keypair)?;
        self.claim = Some(claim.clone());
        self.publish(Stage::Claim, claim).await;
        match self.collect(Stage::Claim).await? {
            Wait::Ready => {}
            other => return self.divert(other, Stage::Claim).await,
        }

        self.set_state(EstablisherState::Finalizing);
        let ack = Envelope::new(self.contract.id(), self.identity.me.clone(), Payload::AcknowledgeComplete);
        if let Err(e) = self.transport.broadcast(&self.peers, &ack).await {
            warn!(error = %e, "Acknowledgement not delivered to every peer");
        }

        let deadline = Instant::now() + self.config.round_timeout;
        match self
            .wait_until(deadline, |s| s.peers.iter().all(|p| s.acks.contains(p)))
            .await?
        {
            Wait::Ready => self.finalize(),
            other => self.divert(other, "acknowledgements").await,
        }
    }

    fn rounds(&self) -> u32 {
        self.contract.parties().len() as u32
    }

    /// Whether the configured conduct sends anything at `stage`
    fn sends(&self, stage: Stage) -> bool {
        match (self.config.conduct, stage) {
            (Conduct::Honest, _) => true,
            (Conduct::StopAfterRound(limit), Stage::Promise(round)) => round <= limit,
            (Conduct::StopAfterRound(limit), Stage::Claim) => limit > self.rounds(),
        }
    }

    fn holds(&self, peer: &PartyId, stage: Stage) -> bool {
        self.held
            .get(peer)
            .map_or(false, |stages| stages.range(stage..).next().is_some())
    }

    async fn publish(&mut self, stage: Stage, signature: WrappedSignature) {
        self.sent = Some(signature.clone());
        let envelope = Envelope::new(
            self.contract.id(),
            self.identity.me.clone(),
            Payload::Signature { stage, signature },
        );
        debug!(%stage, "Publishing signature");
        if let Err(e) = self.transport.broadcast(&self.peers, &envelope).await {
            warn!(%stage, error = %e, "Signature not delivered to every peer");
        }
    }

    async fn collect(&mut self, stage: Stage) -> Result<Wait> {
        let deadline = Instant::now() + self.config.round_timeout;
        self.wait_until(deadline, move |s| s.peers.iter().all(|p| s.holds(p, stage)))
            .await
    }

    /// Handle whatever interrupted a stage
    async fn divert(&mut self, wait: Wait, waiting_for: impl Display) -> Result<()> {
        match wait {
            Wait::Ready => Ok(()),
            Wait::Verdict(verdict) => self.apply_verdict(verdict).await,
            Wait::TimedOut => {
                self.escalate(format!("timed out waiting for {}", waiting_for))
                    .await
            }
            Wait::Misbehaviour(reason) => self.escalate(reason).await,
        }
    }

    /// Receive and process envelopes until `ready` holds, a verdict or an
    /// invalid signature arrives, or `deadline` passes
    async fn wait_until<F>(&mut self, deadline: Instant, ready: F) -> Result<Wait>
    where
        F: Fn(&Self) -> bool + Send,
    {
        let contract_id = self.contract.id();
        loop {
            if ready(&*self) {
                return Ok(Wait::Ready);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Wait::TimedOut);
            }

            let envelope = match self
                .transport
                .receive(&self.identity.me, Some(&contract_id), remaining)
                .await
            {
                Ok(envelope) => envelope,
                Err(Error::Timeout(_)) => return Ok(Wait::TimedOut),
                Err(Error::Deserialization(e)) => {
                    warn!(error = %e, "Dropping undecodable message");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(outcome) = self.handle(envelope) {
                return Ok(outcome);
            }
        }
    }

    fn handle(&mut self, envelope: Envelope) -> Option<Wait> {
        let Envelope { from, payload, .. } = envelope;
        match payload {
            Payload::Signature { stage, signature } => {
                if !self.peers.contains(&from) {
                    warn!(from = %from, %stage, "Ignoring signature from a non-peer");
                    return None;
                }
                if self.held.get(&from).map_or(false, |stages| stages.contains_key(&stage)) {
                    debug!(from = %from, %stage, "Ignoring duplicate signature");
                    return None;
                }
                if let Err(e) = self.contract.verify_from(&from, stage, &signature) {
                    warn!(from = %from, %stage, error = %e, "Invalid signature");
                    return Some(Wait::Misbehaviour(format!("invalid {} from {}: {}", stage, from, e)));
                }
                debug!(from = %from, %stage, "Signature received");
                self.held.entry(from).or_default().insert(stage, signature);
                None
            }
            Payload::AcknowledgeComplete => {
                if self.peers.contains(&from) {
                    debug!(from = %from, "Acknowledgement received");
                    self.acks.insert(from);
                }
                None
            }
            Payload::Verdict(verdict) => {
                if verdict.contract_id == self.contract.id()
                    && &verdict.content_hash == self.contract.content_hash()
                    && verdict.verify(&self.identity.trent_key)
                {
                    Some(Wait::Verdict(verdict))
                } else {
                    warn!(from = %from, "Dropping verdict that does not verify");
                    None
                }
            }
            Payload::Escalation(_) => {
                warn!(from = %from, "Ignoring escalation addressed to a party");
                None
            }
        }
    }

    /// Stop sending and wait for somebody else's escalation to be resolved
    async fn stay_silent(&mut self) -> Result<()> {
        info!("Stopping participation");
        let deadline = Instant::now() + self.config.verdict_timeout;
        loop {
            match self.wait_until(deadline, |_| false).await? {
                Wait::Verdict(verdict) => return self.apply_verdict(verdict).await,
                Wait::TimedOut => return self.escalate("no verdict while silent".to_string()).await,
                Wait::Ready | Wait::Misbehaviour(_) => continue,
            }
        }
    }

    async fn escalate(&mut self, reason: String) -> Result<()> {
        warn!(%reason, arbitrator = %self.identity.trent_id, "Escalating");
        self.set_state(EstablisherState::Escalating);

        // own evidence is what the peers already hold, never a fresh claim
        let mut evidence: Vec<EvidenceItem> = self
            .sent
            .iter()
            .map(|signature| EvidenceItem {
                party: self.identity.me.clone(),
                signature: signature.clone(),
            })
            .collect();
        for peer in &self.peers {
            // the latest stage is the strongest evidence
            if let Some((_, signature)) = self.held.get(peer).and_then(|stages| stages.iter().next_back()) {
                evidence.push(EvidenceItem {
                    party: peer.clone(),
                    signature: signature.clone(),
                });
            }
        }

        let request = EscalationRequest {
            terms: self.contract.terms().clone(),
            evidence,
        };
        let envelope = Envelope::new(self.contract.id(), self.identity.me.clone(), Payload::Escalation(request));
        self.transport.send(&self.identity.trent_id, &envelope).await?;

        let deadline = Instant::now() + self.config.verdict_timeout;
        loop {
            match self.wait_until(deadline, |_| false).await? {
                Wait::Verdict(verdict) => return self.apply_verdict(verdict).await,
                Wait::TimedOut => {
                    warn!(arbitrator = %self.identity.trent_id, "No verdict");
                    return Err(Error::Timeout(format!("verdict from {}", self.identity.trent_id)));
                }
                Wait::Ready | Wait::Misbehaviour(_) => continue,
            }
        }
    }

    async fn apply_verdict(&mut self, verdict: SignedVerdict) -> Result<()> {
        match &verdict.verdict {
            Verdict::Cancel => {
                if self.contract.status() == Status::Finalized {
                    warn!("Keeping finalized contract despite cancellation");
                    self.set_state(EstablisherState::Finalized);
                    return Ok(());
                }
                self.contract.set_status(Status::Cancelled)?;
                self.set_state(EstablisherState::Cancelled);
                info!("Contract cancelled");
            }
            Verdict::Release(released) => {
                for item in released {
                    let key = self
                        .contract
                        .terms()
                        .party(&item.party)
                        .map(|p| p.public_key)
                        .ok_or_else(|| Error::ProtocolViolation(format!("release for unknown party {}", item.party)))?;
                    if !item.recovered.verify(&key, self.contract.content_hash()) {
                        return Err(Error::InvalidProof(format!(
                            "released signature of {} does not verify",
                            item.party
                        )));
                    }
                    if !self.contract.has_signature(&item.party) {
                        self.contract.add_signature(Some(&key), item.signature.clone())?;
                    }
                }
                if !self.contract.is_finalized() {
                    return Err(Error::ProtocolViolation("release verdict is missing signatures".into()));
                }
                self.set_state(EstablisherState::Finalized);
                info!("Contract finalized by arbitrator");
            }
        }
        self.forward(verdict).await;
        Ok(())
    }

    /// Best-effort propagation of a verdict to every peer
    async fn forward(&self, verdict: SignedVerdict) {
        let envelope = Envelope::new(self.contract.id(), self.identity.me.clone(), Payload::Verdict(verdict));
        for peer in &self.peers {
            if let Err(e) = self.transport.send(peer, &envelope).await {
                debug!(peer = %peer, error = %e, "Verdict not forwarded");
            }
        }
    }

    /// Install every claim once all peers acknowledged
    fn finalize(&mut self) -> Result<()> {
        let mut claims = Vec::with_capacity(self.peers.len() + 1);
        for party in self.contract.parties() {
            let claim = if party.id == self.identity.me {
                self.claim.clone()
            } else {
                self.held
                    .get(&party.id)
                    .and_then(|stages| stages.get(&Stage::Claim))
                    .cloned()
            };
            let claim = claim.ok_or_else(|| Error::Internal(format!("claim of {} missing", party.id)))?;
            claims.push((party.public_key, claim));
        }

        for (key, claim) in claims {
            self.contract.add_signature(Some(&key), claim)?;
        }
        self.set_state(EstablisherState::Finalized);
        info!("Contract finalized");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(store) = &self.persistence {
            store.put(&self.contract.to_entity())?;
            debug!(status = ?self.contract.status(), "Contract persisted");
        }
        Ok(())
    }

    fn set_state(&self, state: EstablisherState) {
        debug!(%state, "State change");
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Party;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_cancel_after_finalized_keeps_finalized() {
        let keys: Vec<KeyPair> = (0..2).map(|_| KeyPair::generate()).collect();
        let trent = KeyPair::generate();
        let parties = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Party::new(format!("party-{}", i), *k.public()))
            .collect();
        let mut contract = Contract::draft(vec!["deliver on monday".into()], parties, *trent.public()).unwrap();
        for key in &keys {
            let claim = contract.sign(key).unwrap();
            contract.add_signature(Some(key.public()), claim).unwrap();
        }
        assert_eq!(contract.status(), Status::Finalized);

        let transport = Arc::new(MemoryTransport::new());
        let (state_tx, state_rx) = watch::channel(EstablisherState::Finalized);
        let identity = Identity {
            me: "party-0".into(),
            keypair: keys[0].clone(),
            trent_id: "trent".into(),
            trent_key: *trent.public(),
        };
        let mut session = Session::new(
            identity,
            transport.clone(),
            EstablisherConfig::default(),
            None,
            contract.clone(),
            state_tx,
        );

        let cancel = SignedVerdict::sign(&trent, contract.id(), *contract.content_hash(), Verdict::Cancel).unwrap();
        session.apply_verdict(cancel).await.unwrap();

        assert_eq!(session.contract.status(), Status::Finalized);
        assert!(session.contract.check_contract(&contract));
        assert_eq!(*state_rx.borrow(), EstablisherState::Finalized);
        // a stale cancellation is not passed on
        assert_eq!(transport.delivered_to("party-1"), 0);
    }
}
