//! In-memory transport implementation for testing

use super::{async_trait, Transport};
use crate::messages::Envelope;
use crate::types::{ContractId, PartyId};
use crate::{Error, Result};
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Mailbox-per-peer transport shared by every party in one process
#[derive(Clone)]
pub struct MemoryTransport {
    /// Pending envelopes per recipient, JSON-encoded
    mailboxes: Arc<DashMap<PartyId, VecDeque<(ContractId, Vec<u8>)>>>,
    /// Envelopes delivered per recipient
    delivered: Arc<DashMap<PartyId, usize>>,
    /// Peers that no longer accept envelopes
    disconnected: Arc<DashSet<PartyId>>,
    /// Notification channel
    notify: broadcast::Sender<()>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            mailboxes: Arc::new(DashMap::new()),
            delivered: Arc::new(DashMap::new()),
            disconnected: Arc::new(DashSet::new()),
            notify,
        }
    }

    /// Total envelopes delivered to `peer` so far
    pub fn delivered_to(&self, peer: &str) -> usize {
        self.delivered.get(peer).map(|count| *count).unwrap_or(0)
    }

    /// Make every later send to `peer` fail
    pub fn disconnect(&self, peer: impl Into<PartyId>) {
        self.disconnected.insert(peer.into());
    }

    /// Envelopes waiting in `peer`'s mailbox
    pub fn pending(&self, peer: &str) -> usize {
        self.mailboxes.get(peer).map(|queue| queue.len()).unwrap_or(0)
    }

    fn take(&self, me: &PartyId, contract: Option<&ContractId>) -> Option<Vec<u8>> {
        let mut queue = self.mailboxes.get_mut(me)?;
        let index = queue
            .iter()
            .position(|(id, _)| contract.map_or(true, |wanted| wanted == id))?;
        queue.remove(index).map(|(_, bytes)| bytes)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &PartyId, envelope: &Envelope) -> Result<()> {
        if self.disconnected.contains(to) {
            return Err(Error::Transport(format!("peer {} is unreachable", to)));
        }
        let bytes = serde_json::to_vec(envelope)?;

        self.mailboxes
            .entry(to.clone())
            .or_default()
            .push_back((envelope.contract_id, bytes));
        *self.delivered.entry(to.clone()).or_insert(0) += 1;

        trace!(from = %envelope.from, to = %to, kind = envelope.payload.kind(), "Envelope queued");
        let _ = self.notify.send(());
        Ok(())
    }

    async fn receive(
        &self,
        me: &PartyId,
        contract: Option<&ContractId>,
        timeout: Duration,
    ) -> Result<Envelope> {
        let mut rx = self.notify.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(bytes) = self.take(me, contract) {
                return serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()));
            }

            // Wait for notification, polling in case a wake-up was lagged away
            tokio::select! {
                _ = rx.recv() => continue,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!("message for {}", me)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Payload;
    use uuid::Uuid;

    fn ack(contract_id: ContractId, from: &str) -> Envelope {
        Envelope::new(contract_id, from, Payload::AcknowledgeComplete)
    }

    #[tokio::test]
    async fn test_send_receive() {
        let transport = MemoryTransport::new();
        let id = Uuid::new_v4();

        transport.send(&"bob".to_string(), &ack(id, "alice")).await.unwrap();

        let envelope = transport
            .receive(&"bob".to_string(), Some(&id), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(envelope.from, "alice");
        assert_eq!(transport.delivered_to("bob"), 1);
        assert_eq!(transport.pending("bob"), 0);
    }

    #[tokio::test]
    async fn test_contract_filter() {
        let transport = MemoryTransport::new();
        let bob = "bob".to_string();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        transport.send(&bob, &ack(first, "alice")).await.unwrap();
        transport.send(&bob, &ack(second, "carol")).await.unwrap();

        let envelope = transport.receive(&bob, Some(&second), Duration::from_millis(100)).await.unwrap();
        assert_eq!(envelope.from, "carol");
        assert_eq!(transport.pending("bob"), 1);
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let transport = MemoryTransport::new();
        let result = transport
            .receive(&"bob".to_string(), None, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_broadcast_and_disconnect() {
        let transport = MemoryTransport::new();
        let id = Uuid::new_v4();
        let peers = vec!["bob".to_string(), "carol".to_string()];

        transport.broadcast(&peers, &ack(id, "alice")).await.unwrap();
        assert_eq!(transport.delivered_to("bob"), 1);
        assert_eq!(transport.delivered_to("carol"), 1);

        transport.disconnect("carol");
        assert!(matches!(
            transport.send(&peers[1], &ack(id, "alice")).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_wakes_waiting_receiver() {
        let transport = MemoryTransport::new();
        let id = Uuid::new_v4();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .receive(&"bob".to_string(), Some(&id), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        transport.send(&"bob".to_string(), &ack(id, "alice")).await.unwrap();

        let envelope = waiter.await.unwrap().unwrap();
        assert_eq!(envelope.contract_id, id);
    }
}
