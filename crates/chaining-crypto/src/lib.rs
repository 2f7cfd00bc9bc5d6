//! Contact Chaining Cryptographic Primitives
//!
//! This crate provides the cryptographic building blocks for the contact
//! chaining protocol: identity embedding, single-recipient identity tokens,
//! commutative layered encryption, and message signatures.
//!
//! # Design
//!
//! All functions in this crate are pure. Randomness is always supplied by the
//! caller as `&mut (impl RngCore + CryptoRng)`, so tests can drive every
//! operation from a seeded RNG.
//!
//! Encryption is ElGamal over the Ristretto255 group. A user id is embedded
//! into a group element, which makes layered encryption commutative: each
//! party's layer is an independent additive mask on the same body, so layers
//! can be added and removed in any order.
//!
//! # Security Properties
//!
//! - Token confidentiality: a [`SealedId`] opens only under the recipient's
//!   [`SecretKey`]
//! - Joint disclosure: a [`LayeredCiphertext`] reveals its id only after every
//!   layer has been removed
//! - Authenticity: signatures are Ed25519 over caller-defined canonical
//!   payloads

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod embedding;
pub mod error;
pub mod keys;
pub mod layered;
pub mod sealed;
pub mod signing;

pub use embedding::{embed, extract};
pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use layered::{LayerId, LayeredCiphertext};
pub use sealed::SealedId;
pub use signing::{
    SIGNATURE_SIZE, Signature, SigningKey, VerifyingKey, sign, signing_key_from_bytes, verify,
    verifying_key_from_bytes,
};
