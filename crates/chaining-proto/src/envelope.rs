//! Signed envelopes carried between agencies and telecoms.
//!
//! # Signing Payloads
//!
//! A [`BatchQuery`] is signed by every agency over
//! `CBOR(domain, version, telecom, query_type, tokens)`. Signatures and the
//! degree hint are excluded, so agencies can sign in any order and the hint
//! can be attached after signing.
//!
//! A [`ResponseBatch`] is signed by its telecom over
//! `CBOR(domain, version, telecom, query_digest, responses)`, where
//! `query_digest` is the SHA-256 of the query's signing payload. A response
//! therefore cannot be replayed against a different query.
//!
//! # Invariants
//!
//! - Signing payloads are deterministic: equal envelopes produce equal bytes
//! - `add_signature` is last-write-wins per agency

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AgencyId, ProtoError, TelecomId, codec::WIRE_VERSION};

const QUERY_DOMAIN: &str = "contact-chaining/query";
const RESPONSE_DOMAIN: &str = "contact-chaining/response";

/// SHA-256 of a query's signing payload.
pub type QueryDigest = [u8; 32];

/// Encoded Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureBytes(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(<{} bytes>)", self.0.len())
    }
}

/// A user id sealed for the telecom that owns it.
///
/// Only `owner` can open the token. The token is consumed by exactly one
/// query to `owner`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityToken {
    /// Telecom that can decrypt this token.
    pub owner: TelecomId,
    /// Sealed id bytes.
    #[serde(with = "serde_bytes")]
    pub sealed: Vec<u8>,
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("owner", &self.owner)
            .field("sealed", &format!("<{} bytes>", self.sealed.len()))
            .finish()
    }
}

/// A user id under one encryption layer per agency.
///
/// Only the agencies acting together can disclose it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyCiphertext(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl fmt::Debug for AgencyCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgencyCiphertext(<{} bytes>)", self.0.len())
    }
}

/// Whether the telecom should also expand to neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// Return the agency-ciphertext and a token per neighbor.
    Search,
    /// Return only the agency-ciphertext. Used in the final round.
    Conclude,
}

/// A batch of identity tokens for one telecom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchQuery {
    /// Destination telecom.
    pub telecom: TelecomId,
    /// Search or conclude.
    pub query_type: QueryType,
    /// Tokens to look up, in dispatch order.
    pub tokens: Vec<IdentityToken>,
    /// One signature per agency over [`BatchQuery::signing_payload`].
    pub signatures: BTreeMap<AgencyId, SignatureBytes>,
    /// Degree hint, sent at most once per telecom connection.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_degree: Option<u32>,
}

#[derive(Serialize)]
struct QuerySigningPayload<'a> {
    domain: &'static str,
    version: u8,
    telecom: TelecomId,
    query_type: QueryType,
    tokens: &'a [IdentityToken],
}

impl BatchQuery {
    /// Create an unsigned batch.
    pub fn new(telecom: TelecomId, query_type: QueryType, tokens: Vec<IdentityToken>) -> Self {
        Self { telecom, query_type, tokens, signatures: BTreeMap::new(), max_degree: None }
    }

    /// Bytes every agency signs.
    pub fn signing_payload(&self) -> Result<Vec<u8>, ProtoError> {
        to_cbor(&QuerySigningPayload {
            domain: QUERY_DOMAIN,
            version: WIRE_VERSION,
            telecom: self.telecom,
            query_type: self.query_type,
            tokens: &self.tokens,
        })
    }

    /// SHA-256 of [`BatchQuery::signing_payload`].
    pub fn digest(&self) -> Result<QueryDigest, ProtoError> {
        Ok(Sha256::digest(self.signing_payload()?).into())
    }

    /// Attach `agency`'s signature, replacing any earlier one.
    pub fn add_signature(&mut self, agency: AgencyId, signature: SignatureBytes) {
        self.signatures.insert(agency, signature);
    }

    /// Signature from `agency`, if present.
    pub fn signature(&self, agency: AgencyId) -> Option<&SignatureBytes> {
        self.signatures.get(&agency)
    }

    /// Change the query type.
    ///
    /// Existing signatures no longer cover the payload and are dropped.
    pub fn set_query_type(&mut self, query_type: QueryType) {
        if self.query_type != query_type {
            self.query_type = query_type;
            self.signatures.clear();
        }
    }

    /// Attach the degree hint. Not covered by signatures.
    pub fn set_max_degree(&mut self, max_degree: u32) {
        self.max_degree = Some(max_degree);
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if the batch carries no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Outcome for a single token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenResponse {
    /// The user exists and had not been returned on this connection.
    Data {
        /// User id under every agency's layer.
        agency_ciphertext: AgencyCiphertext,
        /// One token per neighbor. Empty for conclude queries.
        neighbors: Vec<IdentityToken>,
    },
    /// No such user in the telecom's partition.
    NotFound,
    /// Already disclosed on this connection.
    AlreadySent,
    /// The batch failed signature verification. Sent alone.
    InvalidSignature,
}

/// A telecom's signed answer to one [`BatchQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBatch {
    /// Responding telecom.
    pub telecom: TelecomId,
    /// Digest of the query this answers.
    pub query_digest: QueryDigest,
    /// One response per query token, in query order.
    pub responses: Vec<TokenResponse>,
    /// Telecom signature over [`ResponseBatch::signing_payload`].
    pub signature: SignatureBytes,
    /// Telecom thread CPU time spent on the batch. Telemetry only, unsigned.
    pub cpu_time_nanos: u64,
}

#[derive(Serialize)]
struct ResponseSigningPayload<'a> {
    domain: &'static str,
    version: u8,
    telecom: TelecomId,
    query_digest: &'a QueryDigest,
    responses: &'a [TokenResponse],
}

impl ResponseBatch {
    /// Create an unsigned response.
    pub fn new(
        telecom: TelecomId,
        query_digest: QueryDigest,
        responses: Vec<TokenResponse>,
    ) -> Self {
        Self {
            telecom,
            query_digest,
            responses,
            signature: SignatureBytes(Vec::new()),
            cpu_time_nanos: 0,
        }
    }

    /// Bytes the telecom signs.
    pub fn signing_payload(&self) -> Result<Vec<u8>, ProtoError> {
        to_cbor(&ResponseSigningPayload {
            domain: RESPONSE_DOMAIN,
            version: WIRE_VERSION,
            telecom: self.telecom,
            query_digest: &self.query_digest,
            responses: &self.responses,
        })
    }

    /// Returns true if the telecom rejected the whole batch.
    pub fn is_rejected(&self) -> bool {
        matches!(self.responses.as_slice(), [TokenResponse::InvalidSignature])
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| ProtoError::Encode { reason: e.to_string() })?;
    Ok(out)
}
