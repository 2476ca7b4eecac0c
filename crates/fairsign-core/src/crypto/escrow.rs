//! Hashed-ElGamal escrow towards the arbitrator
//!
//! `seal` picks an ephemeral `r`, publishes `C1 = r·G` and encrypts the
//! payload under `SHA-256(tag || r·T || C1)` with ChaCha20-Poly1305. Only the
//! holder of `t` (where `T = t·G`) recomputes `t·C1 = r·T` and opens it.

use super::{KeyPair, PublicKey};
use crate::types::point_serde;
use crate::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::ProjectivePoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    #[serde(with = "point_serde")]
    ephemeral: ProjectivePoint,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

fn derive_key(shared: &ProjectivePoint, ephemeral: &ProjectivePoint) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"fairsign/escrow/v1");
    hasher.update(super::encode_point(shared));
    hasher.update(super::encode_point(ephemeral));
    hasher.finalize().into()
}

impl Escrow {
    /// Encrypt `plaintext` so that only the owner of `recipient` can read it
    pub fn seal(recipient: &PublicKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Self> {
        let r = super::random_scalar();
        let ephemeral = ProjectivePoint::GENERATOR * r;
        let shared = *recipient.as_point() * r;

        let mut key = derive_key(&shared, &ephemeral);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let nonce: [u8; 12] = rand::random();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| Error::Crypto("escrow encryption failed".into()))?;

        Ok(Self {
            ephemeral,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with the recipient's secret; `None` on any mismatch
    pub fn open(&self, recipient: &KeyPair, associated_data: &[u8]) -> Option<Vec<u8>> {
        let t = recipient.secret_scalar().ok()?;
        let shared = self.ephemeral * t;

        let mut key = derive_key(&shared, &self.ephemeral);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad: associated_data,
                },
            )
            .ok()
    }

    /// Canonical encoding, bound into the OR-proof context
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = super::encode_point(&self.ephemeral);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_recipient_opens() {
        let trent = KeyPair::generate();
        let other = KeyPair::generate();
        let escrow = Escrow::seal(trent.public(), b"secret signature", b"aad").unwrap();

        assert_eq!(escrow.open(&trent, b"aad").as_deref(), Some(&b"secret signature"[..]));
        assert!(escrow.open(&other, b"aad").is_none());
        assert!(escrow.open(&trent, b"different aad").is_none());
        assert!(escrow.open(&trent.public_only(), b"aad").is_none());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let trent = KeyPair::generate();
        let mut escrow = Escrow::seal(trent.public(), b"secret signature", b"aad").unwrap();
        escrow.ciphertext[0] ^= 1;
        assert!(escrow.open(&trent, b"aad").is_none());
    }
}
