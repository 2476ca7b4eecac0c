//! Verifiably-recoverable ("wrapped") signatures
//!
//! A wrapped signature carries
//! - an [`Escrow`] of the signer's Schnorr signature on the contract content,
//!   readable only by the arbitrator, and
//! - an OR-proof that the producer knows the signer's secret key or the
//!   arbitrator's key, bound to the content, the stage and the escrow.
//!
//! Parties produce them with the signer branch; the arbitrator produces them
//! with the escrow branch when it releases a recovered signature. Both verify
//! the same way, using public keys only.

use super::sigma::{prove_or, verify_or, Branch, SigmaProof};
use super::{Escrow, KeyPair, PublicKey, SchnorrSignature};
use crate::types::{ContentHash, Stage};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSignature {
    or_proof: SigmaProof,
    escrow: Escrow,
    trent_key: PublicKey,
    stage: Stage,
}

fn proof_context(content: &ContentHash, stage: Stage, escrow: &Escrow) -> Vec<u8> {
    let mut context = Vec::with_capacity(32 + 5 + 128);
    context.extend_from_slice(b"fairsign/wrapped/v1");
    context.extend_from_slice(content);
    context.extend_from_slice(&stage.to_bytes());
    context.extend_from_slice(&escrow.to_bytes());
    context
}

impl WrappedSignature {
    /// Sign `content` at `stage`, escrowing the real signature to `trent_key`
    pub fn sign(
        signer: &KeyPair,
        trent_key: &PublicKey,
        content: &ContentHash,
        stage: Stage,
    ) -> Result<Self> {
        let secret = signer.secret_scalar()?;
        let real = SchnorrSignature::sign(signer, content)?;
        let escrow = Escrow::seal(trent_key, &real.to_bytes(), content)?;

        let context = proof_context(content, stage, &escrow);
        let or_proof = prove_or(Branch::Signer, &secret, signer.public(), trent_key, &context)?;

        Ok(Self {
            or_proof,
            escrow,
            trent_key: *trent_key,
            stage,
        })
    }

    /// Arbitrator-side: re-wrap a recovered signature as a claim for `signer`
    pub fn resolve(
        trent: &KeyPair,
        signer: &PublicKey,
        recovered: &SchnorrSignature,
        content: &ContentHash,
    ) -> Result<Self> {
        if !recovered.verify(signer, content) {
            return Err(Error::InvalidProof(
                "recovered signature does not verify under the signer's key".into(),
            ));
        }
        let secret = trent.secret_scalar()?;
        let escrow = Escrow::seal(trent.public(), &recovered.to_bytes(), content)?;

        let context = proof_context(content, Stage::Claim, &escrow);
        let or_proof = prove_or(Branch::Escrow, &secret, signer, trent.public(), &context)?;

        Ok(Self {
            or_proof,
            escrow,
            trent_key: *trent.public(),
            stage: Stage::Claim,
        })
    }

    /// Proof produced with the escrow branch of `escrow_key`, without any
    /// knowledge of the signer's secret. Valid only under that escrow key.
    #[cfg(test)]
    pub(crate) fn with_escrow_branch(
        escrow_key: &KeyPair,
        signer: &PublicKey,
        content: &ContentHash,
        stage: Stage,
    ) -> Result<Self> {
        let secret = escrow_key.secret_scalar()?;
        let escrow = Escrow::seal(escrow_key.public(), &[0u8; 64], content)?;
        let context = proof_context(content, stage, &escrow);
        let or_proof = prove_or(Branch::Escrow, &secret, signer, escrow_key.public(), &context)?;
        Ok(Self {
            or_proof,
            escrow,
            trent_key: *escrow_key.public(),
            stage,
        })
    }

    /// Check the OR-proof against `signer`, the escrow key and `content`
    pub fn verify(&self, signer: &PublicKey, content: &ContentHash) -> bool {
        let context = proof_context(content, self.stage, &self.escrow);
        verify_or(&self.or_proof, signer, &self.trent_key, &context)
    }

    /// Recover the escrowed Schnorr signature.
    ///
    /// `None` when `trent` is not the escrow key of this signature, the proof
    /// does not verify, or the payload is not a valid signature of `signer`.
    pub fn open_escrow(
        &self,
        trent: &KeyPair,
        signer: &PublicKey,
        content: &ContentHash,
    ) -> Option<SchnorrSignature> {
        if trent.public() != &self.trent_key || !self.verify(signer, content) {
            return None;
        }
        let payload = self.escrow.open(trent, content)?;
        let recovered = SchnorrSignature::from_bytes(&payload)?;
        recovered.verify(signer, content).then_some(recovered)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn trent_key(&self) -> &PublicKey {
        &self.trent_key
    }

    pub fn or_proof(&self) -> &SigmaProof {
        &self.or_proof
    }

    /// Canonical encoding, used when a verdict over signatures is signed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.or_proof.to_bytes();
        out.extend_from_slice(&self.escrow.to_bytes());
        out.extend_from_slice(&self.trent_key.to_bytes());
        out.extend_from_slice(&self.stage.to_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: ContentHash = [7u8; 32];

    #[test]
    fn test_sign_verify() {
        let signer = KeyPair::generate();
        let trent = KeyPair::generate();
        let wrapped = WrappedSignature::sign(&signer, trent.public(), &CONTENT, Stage::Claim).unwrap();

        assert!(wrapped.verify(signer.public(), &CONTENT));
        assert!(!wrapped.verify(KeyPair::generate().public(), &CONTENT));
        assert!(!wrapped.verify(signer.public(), &[8u8; 32]));
    }

    #[test]
    fn test_stage_is_bound() {
        let signer = KeyPair::generate();
        let trent = KeyPair::generate();
        let mut wrapped =
            WrappedSignature::sign(&signer, trent.public(), &CONTENT, Stage::Promise(1)).unwrap();
        assert!(wrapped.verify(signer.public(), &CONTENT));

        wrapped.stage = Stage::Promise(2);
        assert!(!wrapped.verify(signer.public(), &CONTENT));
    }

    #[test]
    fn test_trent_opens_escrow() {
        let signer = KeyPair::generate();
        let trent = KeyPair::generate();
        let wrapped =
            WrappedSignature::sign(&signer, trent.public(), &CONTENT, Stage::Promise(2)).unwrap();

        let recovered = wrapped.open_escrow(&trent, signer.public(), &CONTENT).unwrap();
        assert!(recovered.verify(signer.public(), &CONTENT));

        let impostor = KeyPair::generate();
        assert!(wrapped.open_escrow(&impostor, signer.public(), &CONTENT).is_none());
    }

    #[test]
    fn test_resolved_signature_verifies_like_the_original() {
        let signer = KeyPair::generate();
        let trent = KeyPair::generate();
        let promise =
            WrappedSignature::sign(&signer, trent.public(), &CONTENT, Stage::Promise(2)).unwrap();
        let recovered = promise.open_escrow(&trent, signer.public(), &CONTENT).unwrap();

        let released =
            WrappedSignature::resolve(&trent, signer.public(), &recovered, &CONTENT).unwrap();
        assert_eq!(released.stage(), Stage::Claim);
        assert!(released.verify(signer.public(), &CONTENT));
        assert_eq!(
            released.open_escrow(&trent, signer.public(), &CONTENT),
            Some(recovered)
        );
    }

    #[test]
    fn test_resolve_rejects_foreign_signature() {
        let signer = KeyPair::generate();
        let trent = KeyPair::generate();
        let forged = SchnorrSignature::sign(&KeyPair::generate(), &CONTENT).unwrap();
        let result = WrappedSignature::resolve(&trent, signer.public(), &forged, &CONTENT);
        assert!(matches!(result, Err(Error::InvalidProof(_))));
    }
}
