//! Discrete-log key pairs

use crate::{Error, Result};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce},
    ProjectivePoint, Scalar,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public half of a key pair: `Y = x·G`
///
/// Decoding goes through [`PublicKey::from_bytes`], so a persisted or received
/// identity point is rejected like any other invalid key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PublicKey(ProjectivePoint);

impl PublicKey {
    /// Wrap a point, rejecting the identity
    pub fn from_point(point: ProjectivePoint) -> Result<Self> {
        if point == ProjectivePoint::IDENTITY {
            return Err(Error::InvalidKey("identity is not a valid public key".into()));
        }
        Ok(Self(point))
    }

    /// Parse a compressed SEC1 encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let point = super::decode_point(bytes)
            .ok_or_else(|| Error::InvalidKey("public key is not a curve point".into()))?;
        Self::from_point(point)
    }

    pub fn as_point(&self) -> &ProjectivePoint {
        &self.0
    }

    /// Compressed SEC1 encoding (33 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        super::encode_point(&self.0)
    }
}

impl TryFrom<Vec<u8>> for PublicKey {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for Vec<u8> {
    fn from(key: PublicKey) -> Self {
        key.to_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Secret exponent, kept as bytes so it can be wiped on drop
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    fn from_scalar(scalar: &Scalar) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(scalar.to_bytes().as_slice());
        Self { bytes }
    }

    pub(crate) fn as_scalar(&self) -> Scalar {
        <Scalar as Reduce<U256>>::reduce_bytes(&self.bytes.into())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A party's (or the arbitrator's) key pair.
///
/// The secret is present only in the owner's own instance; keys of remote
/// parties are carried with [`KeyPair::public_only`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl KeyPair {
    /// Generate a fresh key pair with its secret
    pub fn generate() -> Self {
        let mut x = super::random_scalar();
        while bool::from(k256::elliptic_curve::Field::is_zero(&x)) {
            x = super::random_scalar();
        }
        Self {
            public: PublicKey(ProjectivePoint::GENERATOR * x),
            secret: Some(SecretKey::from_scalar(&x)),
        }
    }

    /// Key pair holding only public material
    pub fn from_public(public: PublicKey) -> Self {
        Self {
            public,
            secret: None,
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Copy without the secret
    pub fn public_only(&self) -> Self {
        Self::from_public(self.public)
    }

    /// Secret exponent, or `InvalidKey` for a public-only pair
    pub(crate) fn secret_scalar(&self) -> Result<Scalar> {
        self.secret
            .as_ref()
            .map(SecretKey::as_scalar)
            .ok_or_else(|| Error::InvalidKey("key pair has no private component".into()))
    }
}

/// Generate a key pair; with `with_private == false` only the public half is kept
pub fn generate_keypair(with_private: bool) -> KeyPair {
    let pair = KeyPair::generate();
    if with_private {
        pair
    } else {
        pair.public_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_matches_secret() {
        let pair = KeyPair::generate();
        let x = pair.secret_scalar().unwrap();
        assert_eq!(ProjectivePoint::GENERATOR * x, *pair.public().as_point());
    }

    #[test]
    fn test_public_only_has_no_secret() {
        let pair = generate_keypair(false);
        assert!(!pair.has_secret());
        assert!(matches!(pair.secret_scalar(), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_public_key_bytes() {
        let pair = KeyPair::generate();
        let bytes = pair.public().to_bytes();
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), *pair.public());
        assert!(PublicKey::from_point(ProjectivePoint::IDENTITY).is_err());
    }

    #[test]
    fn test_public_key_json_rejects_identity() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(pair.public()).unwrap();
        let restored: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, *pair.public());

        // SEC1 encoding of the point at infinity
        assert!(serde_json::from_str::<PublicKey>("[0]").is_err());
        assert!(serde_json::from_str::<PublicKey>("[2,1,2,3]").is_err());
    }

    #[test]
    fn test_keypair_json() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(&pair).unwrap();
        let restored: KeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.public(), pair.public());
        assert_eq!(
            restored.secret_scalar().unwrap(),
            pair.secret_scalar().unwrap()
        );
    }
}
