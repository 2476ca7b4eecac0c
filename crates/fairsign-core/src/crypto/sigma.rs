//! Sigma protocols for discrete-log knowledge
//!
//! [`DlogStatement`] is the three-move Schnorr protocol for `P = w·G`.
//! [`prove_or`] composes two of them following Cramer, Damgård and
//! Schoenmakers: the prover runs the branch it holds a witness for, simulates
//! the other one from a pre-chosen challenge and response, and the
//! Fiat-Shamir challenge `c` is split as `c = c_signer + c_escrow (mod n)`.
//! A verifier learns that one of the two discrete logs is known, not which.

use super::{append_point, challenge_scalar, random_scalar, PublicKey};
use crate::types::{point_serde, scalar_serde};
use crate::{Error, Result};
use k256::{ProjectivePoint, Scalar};
use merlin::Transcript;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Statement "I know `w` such that `public = w·base`"
#[derive(Debug, Clone, Copy)]
pub(crate) struct DlogStatement {
    base: ProjectivePoint,
    public: ProjectivePoint,
}

impl DlogStatement {
    pub(crate) fn new(public: &PublicKey) -> Self {
        Self {
            base: ProjectivePoint::GENERATOR,
            public: *public.as_point(),
        }
    }

    pub(crate) fn public(&self) -> &ProjectivePoint {
        &self.public
    }

    /// First move: random nonce and its commitment
    pub(crate) fn commit(&self) -> (Scalar, ProjectivePoint) {
        let nonce = random_scalar();
        (nonce, self.base * nonce)
    }

    /// Third move: `z = k + c·w`
    pub(crate) fn respond(nonce: &Scalar, witness: &Scalar, challenge: &Scalar) -> Scalar {
        *nonce + *challenge * *witness
    }

    /// Commitment that makes `(a, c, z)` an accepting transcript
    pub(crate) fn simulate(&self, challenge: &Scalar, response: &Scalar) -> ProjectivePoint {
        self.base * *response - self.public * *challenge
    }

    pub(crate) fn check(
        &self,
        commitment: &ProjectivePoint,
        challenge: &Scalar,
        response: &Scalar,
    ) -> bool {
        let lhs = self.base * *response;
        let rhs = *commitment + self.public * *challenge;
        bool::from(lhs.to_affine().ct_eq(&rhs.to_affine()))
    }

    fn holds_for(&self, witness: &Scalar) -> bool {
        self.base * *witness == self.public
    }
}

/// Which branch of the OR-proof the prover actually knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    /// Witness is the signer's secret key
    Signer,
    /// Witness is the arbitrator's escrow key
    Escrow,
}

/// The two responses of an OR-proof, one real and one simulated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePair {
    #[serde(with = "scalar_serde")]
    pub signer: Scalar,
    #[serde(with = "scalar_serde")]
    pub escrow: Scalar,
}

/// Non-interactive OR-proof of knowledge of `log_G A` or `log_G B`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigmaProof {
    #[serde(with = "point_serde")]
    signer_commitment: ProjectivePoint,
    #[serde(with = "point_serde")]
    escrow_commitment: ProjectivePoint,
    #[serde(with = "scalar_serde")]
    signer_challenge: Scalar,
    #[serde(with = "scalar_serde")]
    escrow_challenge: Scalar,
    responses: ResponsePair,
}

impl SigmaProof {
    pub fn responses(&self) -> &ResponsePair {
        &self.responses
    }

    /// Canonical byte encoding, used when a proof is itself signed
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * 33 + 4 * 32);
        out.extend_from_slice(&super::encode_point(&self.signer_commitment));
        out.extend_from_slice(&super::encode_point(&self.escrow_commitment));
        out.extend_from_slice(self.signer_challenge.to_bytes().as_slice());
        out.extend_from_slice(self.escrow_challenge.to_bytes().as_slice());
        out.extend_from_slice(self.responses.signer.to_bytes().as_slice());
        out.extend_from_slice(self.responses.escrow.to_bytes().as_slice());
        out
    }
}

fn or_challenge(
    statements: &[DlogStatement; 2],
    commitments: &[ProjectivePoint; 2],
    context: &[u8],
) -> Scalar {
    let mut transcript = Transcript::new(b"fairsign/or-proof/v1");
    transcript.append_message(b"context", context);
    append_point(&mut transcript, b"signer-key", statements[0].public());
    append_point(&mut transcript, b"escrow-key", statements[1].public());
    append_point(&mut transcript, b"signer-commitment", &commitments[0]);
    append_point(&mut transcript, b"escrow-commitment", &commitments[1]);
    challenge_scalar(&mut transcript, b"challenge")
}

/// Prove knowledge of the discrete log of `signer_key` or of `escrow_key`.
///
/// `secret` must be the witness of the branch named by `branch`.
pub fn prove_or(
    branch: Branch,
    secret: &Scalar,
    signer_key: &PublicKey,
    escrow_key: &PublicKey,
    context: &[u8],
) -> Result<SigmaProof> {
    let statements = [DlogStatement::new(signer_key), DlogStatement::new(escrow_key)];
    let (real, simulated) = match branch {
        Branch::Signer => (0, 1),
        Branch::Escrow => (1, 0),
    };

    if !statements[real].holds_for(secret) {
        return Err(Error::InvalidKey(format!(
            "secret does not match the {:?} branch key",
            branch
        )));
    }

    let simulated_challenge = random_scalar();
    let simulated_response = random_scalar();
    let (nonce, real_commitment) = statements[real].commit();

    let mut commitments = [ProjectivePoint::IDENTITY; 2];
    commitments[real] = real_commitment;
    commitments[simulated] =
        statements[simulated].simulate(&simulated_challenge, &simulated_response);

    let challenge = or_challenge(&statements, &commitments, context);
    let real_challenge = challenge - simulated_challenge;
    let real_response = DlogStatement::respond(&nonce, secret, &real_challenge);

    let mut challenges = [Scalar::ZERO; 2];
    let mut responses = [Scalar::ZERO; 2];
    challenges[real] = real_challenge;
    challenges[simulated] = simulated_challenge;
    responses[real] = real_response;
    responses[simulated] = simulated_response;

    Ok(SigmaProof {
        signer_commitment: commitments[0],
        escrow_commitment: commitments[1],
        signer_challenge: challenges[0],
        escrow_challenge: challenges[1],
        responses: ResponsePair {
            signer: responses[0],
            escrow: responses[1],
        },
    })
}

/// Verify an OR-proof. Never errors: any mismatch yields `false`.
pub fn verify_or(
    proof: &SigmaProof,
    signer_key: &PublicKey,
    escrow_key: &PublicKey,
    context: &[u8],
) -> bool {
    let statements = [DlogStatement::new(signer_key), DlogStatement::new(escrow_key)];
    let commitments = [proof.signer_commitment, proof.escrow_commitment];

    let challenge = or_challenge(&statements, &commitments, context);
    let split = proof.signer_challenge + proof.escrow_challenge;

    let split_ok = bool::from(split.ct_eq(&challenge));
    let signer_ok = statements[0].check(
        &proof.signer_commitment,
        &proof.signer_challenge,
        &proof.responses.signer,
    );
    let escrow_ok = statements[1].check(
        &proof.escrow_commitment,
        &proof.escrow_challenge,
        &proof.responses.escrow,
    );

    split_ok & signer_ok & escrow_ok
}
