//! Error types for fair contract signing

use thiserror::Error;

/// Result type alias for contract signing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signing, exchanging or arbitrating a contract
#[derive(Debug, Error)]
pub enum Error {
    /// Key is missing or does not belong to a listed party
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// OR-proof or signature failed verification
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// Timeout waiting for a peer or the arbitrator
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The arbitrator could not open a submitted escrow
    #[error("Escrow recovery failed: {0}")]
    EscrowRecoveryFailure(String),

    /// Message or operation not allowed in the current state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Entity missing from persistence
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
