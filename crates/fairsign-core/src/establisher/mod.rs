//! Per-party signature exchange
//!
//! An [`Establisher`] drives one party through one contract:
//!
//! 1. Promise rounds `1..=N`: every party sends a wrapped signature bound to
//!    the round and waits for everybody else's.
//! 2. Claim: the wrapped signature that goes into the contract.
//! 3. Acknowledgement: every party confirms it holds all claims, then the
//!    contract is finalized.
//!
//! A timeout or an invalid message sends the party to the arbitrator with the
//! best signature it holds from every other party. The arbitrator answers with
//! a signed verdict that releases everything or cancels the contract.

mod session;

use crate::contract::Contract;
use crate::crypto::{KeyPair, PublicKey};
use crate::persistence::Persistence;
use crate::transport::Transport;
use crate::types::{PartyId, Status, Wish};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use session::{Identity, Session};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// How the party behaves during the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conduct {
    Honest,
    /// Send promises for rounds `1..=limit` only, then stay silent and wait
    /// for a verdict
    StopAfterRound(u32),
}

/// Establisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablisherConfig {
    /// Wait for the messages of one stage
    pub round_timeout: Duration,
    /// Wait for the arbitrator's verdict
    pub verdict_timeout: Duration,
    pub conduct: Conduct,
}

impl Default for EstablisherConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(5),
            verdict_timeout: Duration::from_secs(30),
            conduct: Conduct::Honest,
        }
    }
}

impl EstablisherConfig {
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    pub fn with_verdict_timeout(mut self, timeout: Duration) -> Self {
        self.verdict_timeout = timeout;
        self
    }

    pub fn with_conduct(mut self, conduct: Conduct) -> Self {
        self.conduct = conduct;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.round_timeout.is_zero() {
            return Err(Error::InvalidConfig("round timeout must be positive".into()));
        }
        if self.verdict_timeout.is_zero() {
            return Err(Error::InvalidConfig("verdict timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Lifecycle of one establisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstablisherState {
    Created,
    Exchanging,
    Finalizing,
    Escalating,
    Finalized,
    Cancelled,
}

impl EstablisherState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EstablisherState::Finalized | EstablisherState::Cancelled)
    }
}

impl fmt::Display for EstablisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EstablisherState::Created => "created",
            EstablisherState::Exchanging => "exchanging",
            EstablisherState::Finalizing => "finalizing",
            EstablisherState::Escalating => "escalating",
            EstablisherState::Finalized => "finalized",
            EstablisherState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Drives one party through the exchange of one contract
pub struct Establisher<T: Transport + ?Sized> {
    me: PartyId,
    keypair: KeyPair,
    trent_id: PartyId,
    trent_key: PublicKey,
    transport: Arc<T>,
    config: EstablisherConfig,
    persistence: Option<Arc<dyn Persistence>>,
    contract: Option<Contract>,
}

impl<T: Transport + ?Sized + 'static> Establisher<T> {
    pub fn new(
        me: impl Into<PartyId>,
        keypair: KeyPair,
        trent_id: impl Into<PartyId>,
        trent_key: PublicKey,
        transport: Arc<T>,
        config: EstablisherConfig,
    ) -> Self {
        Self {
            me: me.into(),
            keypair,
            trent_id: trent_id.into(),
            trent_key,
            transport,
            config,
            persistence: None,
            contract: None,
        }
    }

    /// Record the contract in `store` when the run ends
    pub fn with_persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn contract(&self) -> Option<&Contract> {
        self.contract.as_ref()
    }

    /// Bind the establisher to `contract`
    pub fn initialize(&mut self, contract: Contract) -> Result<()> {
        let party = contract
            .terms()
            .party(&self.me)
            .ok_or_else(|| Error::InvalidKey(format!("{} is not a party of the contract", self.me)))?;
        if &party.public_key != self.keypair.public() || !self.keypair.has_secret() {
            return Err(Error::InvalidKey(format!(
                "key pair does not match {}'s listed key",
                self.me
            )));
        }
        if contract.arbitrator() != &self.trent_key {
            return Err(Error::InvalidKey(format!(
                "contract {} names another arbitrator than {}",
                contract.id(),
                self.trent_id
            )));
        }
        if contract.terms().party(&self.trent_id).is_some() {
            return Err(Error::InvalidConfig(format!(
                "arbitrator {} cannot be a party",
                self.trent_id
            )));
        }
        if contract.status().is_terminal() {
            return Err(Error::ProtocolViolation(format!(
                "contract {} is already {:?}",
                contract.id(),
                contract.status()
            )));
        }

        self.contract = Some(contract);
        Ok(())
    }

    /// Start the exchange in the background
    pub fn start(self) -> Result<EstablisherHandle> {
        self.config.validate()?;
        let mut contract = self
            .contract
            .ok_or_else(|| Error::ProtocolViolation("establisher was not initialized".into()))?;
        if contract.wish() == Wish::Refuse {
            return Err(Error::ProtocolViolation(format!(
                "{} refuses contract {}",
                self.me,
                contract.id()
            )));
        }
        contract.set_wish(Wish::Accept);
        if contract.status() == Status::Nowhere {
            contract.set_status(Status::Pending)?;
        }

        info!(party = %self.me, contract_id = %contract.id(), conduct = ?self.config.conduct, "Starting exchange");

        let (state_tx, state_rx) = watch::channel(EstablisherState::Created);
        let identity = Identity {
            me: self.me,
            keypair: self.keypair,
            trent_id: self.trent_id,
            trent_key: self.trent_key,
        };
        let session = Session::new(
            identity,
            self.transport,
            self.config,
            self.persistence,
            contract,
            state_tx,
        );
        let task = tokio::spawn(session.run());

        Ok(EstablisherHandle {
            state: state_rx,
            task,
        })
    }
}

/// Completion signals of a running establisher
pub struct EstablisherHandle {
    state: watch::Receiver<EstablisherState>,
    task: JoinHandle<Result<Contract>>,
}

impl EstablisherHandle {
    pub fn state(&self) -> EstablisherState {
        *self.state.borrow()
    }

    /// Wait for `Finalized` or `Cancelled`
    pub async fn wait_until_terminal(&self, timeout: Duration) -> Result<EstablisherState> {
        let mut state = self.state.clone();
        let wait = async move {
            loop {
                let current = *state.borrow_and_update();
                if current.is_terminal() {
                    return Ok(current);
                }
                if state.changed().await.is_err() {
                    let last = *state.borrow();
                    return if last.is_terminal() {
                        Ok(last)
                    } else {
                        Err(Error::Internal(format!("establisher stopped while {}", last)))
                    };
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("establisher to reach a terminal state".into()))?
    }

    /// Wait for the run to end and take back the contract
    pub async fn join(self) -> Result<Contract> {
        self.task.await.map_err(|e| Error::Internal(e.to_string()))?
    }
}
