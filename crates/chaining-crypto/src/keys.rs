//! ElGamal key material.
//!
//! A [`SecretKey`] is a Ristretto scalar `x`; its [`PublicKey`] is `x·G`.
//! Both serialize to 32 bytes and reject non-canonical encodings.

use std::fmt;

use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::{CryptoRng, RngCore};

use crate::CryptoError;

/// Size of serialized keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Secret half of an ElGamal key pair.
#[derive(Clone)]
pub struct SecretKey(pub(crate) Scalar);

/// Public half of an ElGamal key pair.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) RistrettoPoint);

/// A matched secret and public key.
#[derive(Clone)]
pub struct KeyPair {
    /// Secret key.
    pub secret: SecretKey,
    /// Public key derived from `secret`.
    pub public: PublicKey,
}

impl SecretKey {
    /// Generate a fresh secret key.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self(Scalar::random(rng))
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(RistrettoPoint::mul_base(&self.0))
    }

    /// Canonical scalar encoding.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Decode a secret key, rejecting non-canonical scalars.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            kind: "secret",
            reason: format!("expected {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;

        let scalar: Option<Scalar> = Scalar::from_canonical_bytes(bytes).into();
        scalar.map(Self).ok_or_else(|| CryptoError::InvalidKey {
            kind: "secret",
            reason: "non-canonical scalar".to_string(),
        })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl PublicKey {
    /// Compressed point encoding.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.compress().to_bytes()
    }

    /// Decode a public key, rejecting invalid point encodings.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            kind: "public",
            reason: format!("expected {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;

        CompressedRistretto(bytes)
            .decompress()
            .map(Self)
            .ok_or_else(|| CryptoError::InvalidKey {
                kind: "public",
                reason: "not a group element".to_string(),
            })
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let secret = SecretKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }
}
