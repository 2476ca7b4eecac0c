//! Schnorr signatures: the Fiat-Shamir transform of [`DlogStatement`]
//!
//! This is the "real" signature a party commits to during the exchange and
//! the one the arbitrator recovers from an escrow.

use super::sigma::DlogStatement;
use super::{append_point, challenge_scalar, KeyPair, PublicKey};
use crate::types::{point_serde, scalar_serde};
use crate::Result;
use k256::{ProjectivePoint, Scalar};
use merlin::Transcript;
use serde::{Deserialize, Serialize};

/// Encoded size: compressed `R` followed by `s`
pub const SIGNATURE_LEN: usize = 33 + 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    #[serde(with = "point_serde")]
    r: ProjectivePoint,
    #[serde(with = "scalar_serde")]
    s: Scalar,
}

fn challenge(public: &PublicKey, nonce_commitment: &ProjectivePoint, message: &[u8]) -> Scalar {
    let mut transcript = Transcript::new(b"fairsign/schnorr/v1");
    transcript.append_message(b"message", message);
    append_point(&mut transcript, b"public-key", public.as_point());
    append_point(&mut transcript, b"nonce", nonce_commitment);
    challenge_scalar(&mut transcript, b"challenge")
}

impl SchnorrSignature {
    /// Sign `message`; fails with `InvalidKey` for a public-only key pair
    pub fn sign(keypair: &KeyPair, message: &[u8]) -> Result<Self> {
        let secret = keypair.secret_scalar()?;
        let statement = DlogStatement::new(keypair.public());
        let (nonce, r) = statement.commit();
        let e = challenge(keypair.public(), &r, message);
        let s = DlogStatement::respond(&nonce, &secret, &e);
        Ok(Self { r, s })
    }

    pub fn verify(&self, public: &PublicKey, message: &[u8]) -> bool {
        let e = challenge(public, &self.r, message);
        DlogStatement::new(public).check(&self.r, &e, &self.s)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_LEN);
        out.extend_from_slice(&super::encode_point(&self.r));
        out.extend_from_slice(self.s.to_bytes().as_slice());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return None;
        }
        let r = super::decode_point(&bytes[..33])?;
        let s = super::decode_scalar(&bytes[33..])?;
        Some(Self { r, s })
    }
}
