//! Message transport between parties and the arbitrator
//!
//! The core only relies on named peers exchanging [`Envelope`]s with bounded
//! waits; discovery, retries and the wire format belong to the implementation.

use crate::messages::Envelope;
use crate::types::{ContractId, PartyId};
use crate::Result;
use std::time::Duration;

pub use ::async_trait::async_trait;

/// Peer-to-peer envelope transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to one peer
    async fn send(&self, to: &PartyId, envelope: &Envelope) -> Result<()>;

    /// Deliver an envelope to every listed peer
    async fn broadcast(&self, to: &[PartyId], envelope: &Envelope) -> Result<()> {
        futures_util::future::try_join_all(to.iter().map(|peer| self.send(peer, envelope))).await?;
        Ok(())
    }

    /// Next envelope addressed to `me`, optionally restricted to one contract.
    ///
    /// Fails with `Error::Timeout` once `timeout` elapses without a match.
    async fn receive(
        &self,
        me: &PartyId,
        contract: Option<&ContractId>,
        timeout: Duration,
    ) -> Result<Envelope>;
}

/// In-memory transport for testing
pub mod memory;

pub use memory::MemoryTransport;
