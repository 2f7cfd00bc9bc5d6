//! Contact Chaining Wire Protocol
//!
//! Envelope types exchanged between the Leader, Oversight agencies and
//! Telecoms, plus the framing used to put them on a TCP stream.
//!
//! # Design
//!
//! This crate is pure data. Identity tokens, agency-ciphertexts and
//! signatures are carried as opaque bytes; producing and checking them is the
//! job of `chaining-crypto` and `chaining-core`. What this crate does own is
//! the *canonical signing payload* of each signed envelope, so that every
//! party hashes and signs exactly the same bytes.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+---------+------------------+
//! | length (u32 BE)| version | CBOR body        |
//! +----------------+---------+------------------+
//! ```
//!
//! `length` counts the version byte and the body. Frames above
//! [`MAX_FRAME_SIZE`] or with an unknown version are rejected.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod message;

pub use codec::{
    FrameDecoder, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, WIRE_VERSION, decode_payload, encode_frame,
    frame_length,
};
pub use envelope::{
    AgencyCiphertext, BatchQuery, IdentityToken, QueryDigest, QueryType, ResponseBatch,
    SignatureBytes, TokenResponse,
};
pub use error::ProtoError;
pub use ids::{AgencyId, PartyId, TelecomId, UserId, owner_of};
pub use message::{AuditOutcome, LeaderMessage, OversightMessage};
