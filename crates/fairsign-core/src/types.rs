//! Core types shared by the contract, establisher and arbitrator

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a party (user id in the hosting application)
pub type PartyId = String;

/// Identifier of a contract session
pub type ContractId = Uuid;

/// SHA-256 digest of a contract's hashable content
pub type ContentHash = [u8; 32];

/// Externally visible status of a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// No exchange has started yet
    Nowhere,
    /// Exchange in progress, some signatures may be missing
    Pending,
    /// Cancelled by the arbitrator; terminal
    Cancelled,
    /// Every party holds every signature; terminal
    Finalized,
}

impl Status {
    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Cancelled | Status::Finalized)
    }
}

/// A party's private intent regarding a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Wish {
    Unset,
    Accept,
    Refuse,
}

/// Exchange stage a wrapped signature is bound to.
///
/// Promises are numbered from 1; the claim is the round-free signature that
/// ends up in the contract. Ordering follows protocol progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Promise(u32),
    Claim,
}

impl Stage {
    pub(crate) fn to_bytes(self) -> [u8; 5] {
        match self {
            Stage::Promise(round) => {
                let mut out = [0u8; 5];
                out[0] = 0x01;
                out[1..].copy_from_slice(&round.to_be_bytes());
                out
            }
            Stage::Claim => [0xff, 0, 0, 0, 0],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Promise(round) => write!(f, "promise#{}", round),
            Stage::Claim => f.write_str("claim"),
        }
    }
}

/// Serde helpers for curve points (SEC1 compressed bytes)
pub(crate) mod point_serde {
    use k256::{elliptic_curve::sec1::ToEncodedPoint, ProjectivePoint};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(point: &ProjectivePoint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = point.to_affine().to_encoded_point(true);
        serializer.serialize_bytes(encoded.as_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ProjectivePoint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        crate::crypto::decode_point(&bytes)
            .ok_or_else(|| serde::de::Error::custom("Invalid curve point"))
    }
}

/// Serde helpers for scalars (32 big-endian bytes, canonical)
pub(crate) mod scalar_serde {
    use k256::Scalar;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = scalar.to_bytes();
        serializer.serialize_bytes(bytes.as_slice())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        crate::crypto::decode_scalar(&bytes)
            .ok_or_else(|| serde::de::Error::custom("Invalid scalar"))
    }
}
