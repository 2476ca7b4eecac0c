//! Bounded verdict cache

use crate::messages::SignedVerdict;
use crate::types::{ContentHash, ContractId};
use std::collections::{HashMap, VecDeque};

/// A contract id together with the content it was resolved for
pub type VerdictKey = (ContractId, ContentHash);

/// Resolved verdicts by contract id and content, oldest evicted first once full
#[derive(Debug)]
pub struct VerdictCache {
    capacity: usize,
    verdicts: HashMap<VerdictKey, SignedVerdict>,
    order: VecDeque<VerdictKey>,
}

impl VerdictCache {
    /// `capacity` must be positive, see `ArbitratorConfig::validate`
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "verdict cache needs a positive capacity");
        Self {
            capacity,
            verdicts: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &VerdictKey) -> Option<&SignedVerdict> {
        self.verdicts.get(key)
    }

    pub fn contains(&self, key: &VerdictKey) -> bool {
        self.verdicts.contains_key(key)
    }

    /// Insert a verdict and return the keys evicted to make room
    pub fn insert(&mut self, verdict: SignedVerdict) -> Vec<VerdictKey> {
        let key = (verdict.contract_id, verdict.content_hash);
        if self.verdicts.insert(key, verdict).is_some() {
            return Vec::new();
        }
        self.order.push_back(key);

        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.verdicts.remove(&oldest);
                evicted.push(oldest);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}
