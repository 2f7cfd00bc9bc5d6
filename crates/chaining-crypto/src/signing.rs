//! Ed25519 signatures over canonical payloads.
//!
//! Payload construction is the caller's job; this module only signs and
//! verifies bytes. Verification never errors: a malformed or mismatched
//! signature is simply `false`.

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, Signer, Verifier};

use crate::CryptoError;

/// Size of an encoded signature.
pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Sign `payload`.
pub fn sign(payload: &[u8], key: &SigningKey) -> Signature {
    key.sign(payload)
}

/// Verify `signature` over `payload`.
pub fn verify(payload: &[u8], signature: &[u8], key: &VerifyingKey) -> bool {
    Signature::from_slice(signature).is_ok_and(|sig| key.verify(payload, &sig).is_ok())
}

/// Decode a signing key from its 32-byte seed.
pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, CryptoError> {
    let seed: [u8; SECRET_KEY_LENGTH] =
        bytes.try_into().map_err(|_| length_error("signing", SECRET_KEY_LENGTH, bytes))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Decode a verifying key, rejecting invalid curve points.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let raw: [u8; PUBLIC_KEY_LENGTH] =
        bytes.try_into().map_err(|_| length_error("verifying", PUBLIC_KEY_LENGTH, bytes))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| CryptoError::InvalidKey { kind: "verifying", reason: e.to_string() })
}

fn length_error(kind: &'static str, expected: usize, bytes: &[u8]) -> CryptoError {
    let reason = format!("expected {expected} bytes, got {}", bytes.len());
    CryptoError::InvalidKey { kind, reason }
}
