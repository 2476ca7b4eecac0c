//! # FairSign Core
//!
//! Optimistic fair multi-party contract signing.
//!
//! This crate provides:
//! - Verifiably-recoverable signatures built from a Sigma OR-proof and an
//!   escrow only the arbitrator can open
//! - The contract aggregate that collects and checks signatures
//! - The per-party exchange state machine ([`Establisher`])
//! - The arbitrator ("Trent") that releases or cancels a stalled exchange
//!
//! ## Protocol Overview
//!
//! Parties exchange wrapped signatures directly over several rounds. The
//! arbitrator stays offline unless somebody times out or cheats; it then
//! either recovers every party's signature from the submitted escrows or
//! cancels the contract for all parties, so nobody ends up with an
//! advantage.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fairsign_core::{Contract, Establisher, EstablisherConfig, MemoryTransport};
//!
//! let mut establisher = Establisher::new("alice", keypair, "trent", trent_key, transport, EstablisherConfig::default());
//! establisher.initialize(contract)?;
//! let contract = establisher.start()?.join().await?;
//! ```

pub mod arbitrator;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod establisher;
pub mod messages;
pub mod persistence;
pub mod transport;
pub mod types;

pub use arbitrator::{Adjudication, Arbitrator, ArbitratorConfig, ArbitratorHandle};
pub use contract::{Contract, ContractEntity, ContractTerms, Party};
pub use crypto::{generate_keypair, KeyPair, PublicKey, WrappedSignature};
pub use error::{Error, Result};
pub use establisher::{Conduct, Establisher, EstablisherConfig, EstablisherHandle, EstablisherState};
pub use messages::{Envelope, Payload, SignedVerdict, Verdict};
pub use persistence::{KeyDirectory, MemoryStore, Persistence, PersistenceExt};
pub use transport::{MemoryTransport, Transport};
pub use types::{ContentHash, ContractId, PartyId, Stage, Status, Wish};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
