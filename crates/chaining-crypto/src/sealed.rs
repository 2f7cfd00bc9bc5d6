//! Single-recipient identity tokens.
//!
//! A [`SealedId`] is plain ElGamal of an embedded id under one recipient's
//! public key: `(r·G, M + r·H)`. Only the holder of the matching secret can
//! open it. Every seal uses fresh randomness, so sealing the same id twice
//! yields unlinkable tokens.

use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::{CryptoRng, RngCore};

use crate::{CryptoError, PublicKey, SecretKey, embed, extract};

/// Encoded size of a sealed id.
pub const SEALED_SIZE: usize = 64;

/// A user id encrypted for a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedId {
    ephemeral: RistrettoPoint,
    masked: RistrettoPoint,
}

impl SealedId {
    /// Encrypt `id` for the holder of `recipient`.
    pub fn seal(
        id: u64,
        recipient: &PublicKey,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Self, CryptoError> {
        let message = embed(id)?;
        let r = Scalar::random(rng);
        Ok(Self { ephemeral: RistrettoPoint::mul_base(&r), masked: message + r * recipient.0 })
    }

    /// Decrypt with the recipient's secret key.
    ///
    /// Opening with any other key fails with [`CryptoError::NotAnIdentity`]
    /// (with overwhelming probability).
    pub fn open(&self, key: &SecretKey) -> Result<u64, CryptoError> {
        extract(&(self.masked - key.0 * self.ephemeral))
    }

    /// Fixed-size wire encoding.
    pub fn to_bytes(&self) -> [u8; SEALED_SIZE] {
        let mut out = [0u8; SEALED_SIZE];
        out[..32].copy_from_slice(self.ephemeral.compress().as_bytes());
        out[32..].copy_from_slice(self.masked.compress().as_bytes());
        out
    }

    /// Decode a sealed id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SEALED_SIZE {
            return Err(CryptoError::InvalidCiphertext {
                reason: format!("sealed id must be {SEALED_SIZE} bytes, got {}", bytes.len()),
            });
        }
        Ok(Self { ephemeral: decode_point(&bytes[..32])?, masked: decode_point(&bytes[32..])? })
    }
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<RistrettoPoint, CryptoError> {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    CompressedRistretto(buf)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidCiphertext { reason: "not a group element".to_string() })
}
