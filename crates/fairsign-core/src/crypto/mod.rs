//! Cryptographic primitives
//!
//! Everything lives in the secp256k1 prime-order group:
//! - [`keys`]: discrete-log key pairs for parties and for the arbitrator
//! - [`sigma`]: the Schnorr Sigma statement and its OR-composition
//! - [`schnorr`]: plain Schnorr signatures (the "real" signature)
//! - [`escrow`]: hashed-ElGamal escrow that only the arbitrator can open
//! - [`wrapped`]: the verifiably-recoverable signature built from the above

pub mod escrow;
pub mod keys;
pub mod schnorr;
pub mod sigma;
pub mod wrapped;

pub use escrow::Escrow;
pub use keys::{generate_keypair, KeyPair, PublicKey, SecretKey};
pub use schnorr::SchnorrSignature;
pub use sigma::{prove_or, verify_or, Branch, ResponsePair, SigmaProof};
pub use wrapped::WrappedSignature;

use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar,
};
use merlin::Transcript;
use rand::rngs::OsRng;

/// Compressed SEC1 encoding of a point
pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a SEC1 point, `None` if the bytes are not on the curve
pub(crate) fn decode_point(bytes: &[u8]) -> Option<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    affine.map(ProjectivePoint::from)
}

/// Decode a canonical 32-byte scalar
pub(crate) fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
    let array: [u8; 32] = bytes.try_into().ok()?;
    Option::<Scalar>::from(Scalar::from_repr(array.into()))
}

pub(crate) fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

pub(crate) fn append_point(transcript: &mut Transcript, label: &'static [u8], point: &ProjectivePoint) {
    transcript.append_message(label, &encode_point(point));
}

/// Squeeze a challenge scalar out of a Fiat-Shamir transcript
pub(crate) fn challenge_scalar(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    let mut bytes = [0u8; 32];
    transcript.challenge_bytes(label, &mut bytes);
    <Scalar as Reduce<U256>>::reduce_bytes(&bytes.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_encoding() {
        let point = ProjectivePoint::GENERATOR * random_scalar();
        let bytes = encode_point(&point);
        assert_eq!(bytes.len(), 33);
        assert_eq!(decode_point(&bytes), Some(point));
        assert_eq!(decode_point(&[0x02; 12]), None);
    }

    #[test]
    fn test_scalar_decoding_rejects_bad_length() {
        assert!(decode_scalar(&[1u8; 31]).is_none());
        assert!(decode_scalar(&[0xff; 32]).is_none());
        let s = random_scalar();
        assert_eq!(decode_scalar(s.to_bytes().as_slice()), Some(s));
    }
}
