//! Leader and Oversight message sets.
//!
//! The Leader ↔ Telecom channel carries bare [`BatchQuery`] requests and
//! [`ResponseBatch`] replies. The Leader ↔ Oversight channel carries the
//! enums below.
//!
//! # Protocol Flow
//!
//! ```text
//! Oversight                      Leader
//!    | ---- Hello{agency} ---------> |
//!    | <--- Target{target} --------- |
//!    | <--- InitialQuery{batch} ---- |
//!    | ---- InitialSignature ------> |
//!    | <--- Round{d, responses} ---- |   repeated while work remains
//!    | ---- RoundSignatures -------> |
//!    | <--- Final{responses} ------- |
//!    | ---- Audit{outcome} --------> |
//! ```
//!
//! An Oversight agency may answer any Leader message with `Refusal`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AgencyId, BatchQuery, ResponseBatch, SignatureBytes, TelecomId, UserId};

/// Leader → Oversight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderMessage {
    /// Search target, sent in reply to `Hello`.
    Target {
        /// Target user id.
        target: UserId,
    },
    /// The distance-0 query for the target, signed by the Leader.
    InitialQuery {
        /// Single-token batch for the target's owner.
        batch: BatchQuery,
    },
    /// Responses from the previous round; asks for signatures on round
    /// `distance`.
    Round {
        /// Distance of the batches to be signed.
        distance: u32,
        /// Previous round's responses, ordered by telecom.
        responses: Vec<ResponseBatch>,
    },
    /// Responses from the last round; asks for the audit verdict.
    Final {
        /// Last round's responses, ordered by telecom.
        responses: Vec<ResponseBatch>,
    },
}

/// Result of an Oversight agency's end-of-run audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// Every query matched the independently recomputed frontier.
    Passed,
    /// The run diverged from what was authorized.
    Failed {
        /// Why the audit failed.
        reason: String,
    },
}

impl AuditOutcome {
    /// Returns true for [`AuditOutcome::Passed`].
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Oversight → Leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OversightMessage {
    /// Connection handshake.
    Hello {
        /// Sender's agency id.
        agency: AgencyId,
    },
    /// Co-signature on the initial query.
    InitialSignature {
        /// Signature over the initial batch payload.
        signature: SignatureBytes,
    },
    /// Co-signatures on every batch of the requested round.
    RoundSignatures {
        /// One signature per destination telecom.
        signatures: BTreeMap<TelecomId, SignatureBytes>,
    },
    /// End-of-run verdict.
    Audit {
        /// Pass or fail.
        outcome: AuditOutcome,
        /// CPU time the agency spent on the run.
        cpu_time_nanos: u64,
    },
    /// The agency will not co-sign; the run cannot proceed.
    Refusal {
        /// Why the request was refused.
        reason: String,
    },
}
