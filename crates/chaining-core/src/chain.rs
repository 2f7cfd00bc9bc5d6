//! Role-parameterized BFS-by-rounds state machine.
//!
//! The Leader and every Oversight agency each own one [`ChainState`]. Both
//! feed it the same signed telecom responses and both derive the next round's
//! batches from it. The only role difference is at the start: the Leader
//! creates the initial query, an Oversight agency checks it.
//!
//! # Round Lifecycle
//!
//! ```text
//!   begin / accept_initial        distance 0 batch pending
//!          │
//!          ▼
//!   sign_own / attach_signatures  every agency signature attached
//!          │
//!          ▼
//!   absorb(responses)             outputs appended, frontier rebuilt,
//!          │                      distance += 1
//!          ▼
//!   next_batches                  frontier drained into pending batches
//!          │                      (CONCLUDE when distance == max_distance)
//!          └──► back to signing until the frontier is empty
//! ```
//!
//! # Invariants
//!
//! - Batches are built from the frontier in ascending telecom order and token
//!   arrival order, so equal response sequences give byte-identical batches
//! - A response is only absorbed after its telecom signature, query digest
//!   and token count all check out against the pending batch
//! - The frontier is only mutated inside `absorb` and `next_batches`

use std::collections::BTreeMap;

use chaining_proto::{
    AgencyCiphertext, AgencyId, BatchQuery, PartyId, QueryType, ResponseBatch, SignatureBytes,
    TelecomId, TokenResponse, owner_of,
};
use rand::{CryptoRng, RngCore};

use crate::{
    ChainError, KeyStore,
    config::{SearchParams, Topology},
    frontier::{Admission, Frontier, Suppressed},
};

/// Which side of the protocol a state machine is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The investigating agency; creates queries.
    Leader,
    /// An auditing agency; recomputes and co-signs queries.
    Oversight(AgencyId),
}

impl Role {
    /// Agency id behind this role.
    pub fn agency(self) -> AgencyId {
        match self {
            Self::Leader => AgencyId::LEADER,
            Self::Oversight(id) => id,
        }
    }
}

/// Signing and verification available to a role.
pub trait RoleCapability {
    /// Sign `payload` as this party.
    fn sign(&self, payload: &[u8]) -> SignatureBytes;

    /// Check `signer`'s signature over `payload`.
    fn verify(&self, signer: PartyId, payload: &[u8], signature: &SignatureBytes) -> bool;
}

impl RoleCapability for KeyStore {
    fn sign(&self, payload: &[u8]) -> SignatureBytes {
        Self::sign(self, payload)
    }

    fn verify(&self, signer: PartyId, payload: &[u8], signature: &SignatureBytes) -> bool {
        Self::verify(self, signer, payload, signature)
    }
}

/// What one `absorb` call found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Distance of the absorbed responses.
    pub distance: u32,
    /// New agency-ciphertexts.
    pub found: usize,
    /// Tokens the telecom had no record of.
    pub not_found: usize,
    /// Tokens already disclosed on the same connection.
    pub already_sent: usize,
    /// Tokens pending for the next round.
    pub admitted: usize,
}

/// Search progress shared by the Leader and Oversight roles.
#[derive(Debug)]
pub struct ChainState {
    role: Role,
    params: SearchParams,
    topology: Topology,
    distance: u32,
    frontier: Frontier,
    pending: BTreeMap<TelecomId, BatchQuery>,
    outputs: Vec<AgencyCiphertext>,
    target_degree: Option<usize>,
    suppressed: Suppressed,
    started: bool,
}

impl ChainState {
    /// Create a state machine for `role`.
    pub fn new(role: Role, params: SearchParams, topology: Topology) -> Self {
        Self {
            role,
            params,
            topology,
            distance: 0,
            frontier: Frontier::new(),
            pending: BTreeMap::new(),
            outputs: Vec::new(),
            target_degree: None,
            suppressed: Suppressed::default(),
            started: false,
        }
    }

    /// Query type for batches at `distance`.
    pub fn query_type_at(&self, distance: u32) -> QueryType {
        if distance >= self.params.max_distance { QueryType::Conclude } else { QueryType::Search }
    }

    fn target_owner(&self) -> Result<TelecomId, ChainError> {
        owner_of(self.params.target, self.topology.telecoms)
            .ok_or_else(|| ChainError::protocol("no telecoms"))
    }

    /// Leader: build the unsigned distance-0 query for the target.
    pub fn begin(
        &mut self,
        keys: &KeyStore,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<BatchQuery, ChainError> {
        if self.role != Role::Leader {
            return Err(ChainError::protocol("only the Leader creates the initial query"));
        }
        if self.started {
            return Err(ChainError::protocol("search already started"));
        }

        let owner = self.target_owner()?;
        let token = keys.encrypt_for_telecom(owner, self.params.target, rng)?;
        let batch = BatchQuery::new(owner, self.query_type_at(0), vec![token]);

        self.pending.insert(owner, batch.clone());
        self.started = true;
        Ok(batch)
    }

    /// Oversight: check the Leader's initial query and adopt it.
    ///
    /// The token itself is opaque; what can be checked is that it is a
    /// single token for the target's owner, of the right type, signed by the
    /// Leader.
    pub fn accept_initial(
        &mut self,
        batch: &BatchQuery,
        caps: &impl RoleCapability,
    ) -> Result<(), ChainError> {
        if self.started {
            return Err(ChainError::protocol("search already started"));
        }

        let leader = PartyId::Agency(AgencyId::LEADER);
        let payload = batch.signing_payload()?;
        let signed = batch
            .signature(AgencyId::LEADER)
            .is_some_and(|sig| caps.verify(leader, &payload, sig));
        if !signed {
            let context = "initial query".to_string();
            return Err(ChainError::Signature { signer: leader, context });
        }

        let owner = self.target_owner()?;
        let expected_type = self.query_type_at(0);
        if batch.telecom != owner || batch.tokens.len() != 1 || batch.tokens[0].owner != owner {
            return Err(ChainError::Audit {
                reason: format!(
                    "initial query is not a single token for {owner} (got {} tokens for {})",
                    batch.len(),
                    batch.telecom
                ),
            });
        }
        if batch.query_type != expected_type {
            return Err(ChainError::Audit {
                reason: format!(
                    "initial query type {:?}, expected {expected_type:?}",
                    batch.query_type
                ),
            });
        }

        let mut adopted = BatchQuery::new(batch.telecom, batch.query_type, batch.tokens.clone());
        adopted.signatures = batch.signatures.clone();
        self.pending.insert(owner, adopted);
        self.started = true;
        Ok(())
    }

    /// Sign every pending batch as this role, without attaching.
    pub fn sign_pending(
        &self,
        caps: &impl RoleCapability,
    ) -> Result<BTreeMap<TelecomId, SignatureBytes>, ChainError> {
        self.pending
            .iter()
            .map(|(&telecom, batch)| Ok((telecom, caps.sign(&batch.signing_payload()?))))
            .collect()
    }

    /// Sign every pending batch as this role and attach the signatures.
    pub fn sign_own(&mut self, caps: &impl RoleCapability) -> Result<(), ChainError> {
        let me = self.role.agency();
        for (telecom, signature) in self.sign_pending(caps)? {
            if let Some(batch) = self.pending.get_mut(&telecom) {
                batch.add_signature(me, signature);
            }
        }
        Ok(())
    }

    /// Verify and attach `signer`'s co-signatures, one per pending batch.
    pub fn attach_signatures(
        &mut self,
        signer: AgencyId,
        signatures: &BTreeMap<TelecomId, SignatureBytes>,
        caps: &impl RoleCapability,
    ) -> Result<(), ChainError> {
        let party = PartyId::Agency(signer);
        if !signatures.keys().eq(self.pending.keys()) {
            return Err(ChainError::Signature {
                signer: party,
                context: format!(
                    "signed {} batches, {} pending",
                    signatures.len(),
                    self.pending.len()
                ),
            });
        }

        for (telecom, batch) in &mut self.pending {
            let signature = &signatures[telecom];
            if !caps.verify(party, &batch.signing_payload()?, signature) {
                let context = format!("batch for {telecom}");
                return Err(ChainError::Signature { signer: party, context });
            }
            batch.add_signature(signer, signature.clone());
        }
        Ok(())
    }

    /// Batches awaiting responses, by telecom.
    pub fn pending(&self) -> &BTreeMap<TelecomId, BatchQuery> {
        &self.pending
    }

    /// Verify a round of responses and fold them into the state.
    ///
    /// `responses` must answer every pending batch exactly once, in any
    /// order. On success the pending set is cleared, outputs are appended,
    /// the frontier holds the admitted neighbors and the distance advances.
    pub fn absorb(
        &mut self,
        responses: &[ResponseBatch],
        caps: &impl RoleCapability,
    ) -> Result<RoundSummary, ChainError> {
        if self.pending.is_empty() {
            return Err(ChainError::protocol("responses received with no pending batch"));
        }

        let mut by_telecom: BTreeMap<TelecomId, &ResponseBatch> = BTreeMap::new();
        for response in responses {
            if by_telecom.insert(response.telecom, response).is_some() {
                let telecom = response.telecom;
                return Err(ChainError::protocol(format!("two responses from {telecom}")));
            }
        }
        if !by_telecom.keys().eq(self.pending.keys()) {
            return Err(ChainError::protocol(format!(
                "{} responses for {} pending batches",
                by_telecom.len(),
                self.pending.len()
            )));
        }

        for (telecom, batch) in &self.pending {
            verify_response(batch, by_telecom[telecom], caps)?;
        }

        let distance = self.distance;
        let mut summary = RoundSummary { distance, ..RoundSummary::default() };
        let mut frontier = Frontier::new();

        for (telecom, batch) in &self.pending {
            for response in &by_telecom[telecom].responses {
                match response {
                    TokenResponse::Data { agency_ciphertext, neighbors } => {
                        if batch.query_type == QueryType::Conclude && !neighbors.is_empty() {
                            let reason = format!("{telecom} expanded a conclude query");
                            return Err(ChainError::protocol(reason));
                        }
                        let telecoms = self.topology.telecoms;
                        if let Some(bad) = neighbors.iter().find(|t| t.owner.0 >= telecoms) {
                            let reason = format!("neighbor token for unknown {}", bad.owner);
                            return Err(ChainError::protocol(reason));
                        }
                        if distance == 0 {
                            self.target_degree = Some(neighbors.len());
                        }

                        self.outputs.push(agency_ciphertext.clone());
                        summary.found += 1;

                        let admission = frontier.admit_neighbors(
                            &self.params,
                            distance,
                            neighbors,
                            &mut self.suppressed,
                        );
                        if admission == Admission::DegreeLimit {
                            tracing::debug!(
                                distance,
                                degree = neighbors.len(),
                                "neighbors over max degree discarded"
                            );
                        }
                    },
                    TokenResponse::NotFound if distance == 0 => {
                        return Err(ChainError::protocol(format!("target not found at {telecom}")));
                    },
                    TokenResponse::NotFound => {
                        tracing::warn!(%telecom, distance, "token not found");
                        summary.not_found += 1;
                    },
                    TokenResponse::AlreadySent => summary.already_sent += 1,
                    TokenResponse::InvalidSignature => {
                        let reason = format!("{telecom} mixed a signature rejection into a batch");
                        return Err(ChainError::protocol(reason));
                    },
                }
            }
        }

        if distance >= self.params.max_distance && self.suppressed.by_distance > 0 {
            tracing::debug!(
                suppressed = self.suppressed.by_distance,
                "neighbors beyond max distance not queried"
            );
        }

        self.pending.clear();
        self.frontier = frontier;
        self.distance += 1;
        summary.admitted = self.frontier.len();
        Ok(summary)
    }

    /// Drain the frontier into the next round's unsigned batches.
    ///
    /// Returns an empty list when the search is complete.
    pub fn next_batches(&mut self) -> Result<Vec<BatchQuery>, ChainError> {
        if !self.pending.is_empty() {
            return Err(ChainError::protocol("previous round still pending"));
        }
        if self.frontier.is_empty() {
            return Ok(Vec::new());
        }
        if self.distance > self.params.max_distance {
            return Err(ChainError::protocol(format!(
                "frontier non-empty at distance {} beyond max {}",
                self.distance, self.params.max_distance
            )));
        }

        let query_type = self.query_type_at(self.distance);
        for (telecom, tokens) in self.frontier.drain() {
            if !tokens.is_empty() {
                self.pending.insert(telecom, BatchQuery::new(telecom, query_type, tokens));
            }
        }
        Ok(self.pending.values().cloned().collect())
    }

    /// Returns true when nothing is pending and nothing is left to query.
    pub fn is_complete(&self) -> bool {
        self.started && self.pending.is_empty() && self.frontier.is_empty()
    }

    /// This state machine's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Authorized search parameters.
    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// Distance of the next batches to be built or currently pending.
    pub fn distance(&self) -> u32 {
        self.distance
    }

    /// Tokens waiting for the next round.
    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    /// Agency-ciphertexts found so far.
    pub fn outputs(&self) -> &[AgencyCiphertext] {
        &self.outputs
    }

    /// Take ownership of the outputs.
    pub fn into_outputs(self) -> Vec<AgencyCiphertext> {
        self.outputs
    }

    /// Number of neighbors the target had, once known.
    pub fn target_degree(&self) -> Option<usize> {
        self.target_degree
    }

    /// Neighbors dropped by the admission rule so far.
    pub fn suppressed(&self) -> Suppressed {
        self.suppressed
    }
}

fn verify_response(
    batch: &BatchQuery,
    response: &ResponseBatch,
    caps: &impl RoleCapability,
) -> Result<(), ChainError> {
    let telecom = response.telecom;
    if response.is_rejected() {
        return Err(ChainError::RejectedByTelecom { telecom });
    }

    let signer = PartyId::Telecom(telecom);
    if !caps.verify(signer, &response.signing_payload()?, &response.signature) {
        return Err(ChainError::Signature { signer, context: "response batch".to_string() });
    }
    if response.query_digest != batch.digest()? {
        return Err(ChainError::protocol(format!("{telecom} answered a different query")));
    }
    if response.responses.len() != batch.len() {
        return Err(ChainError::protocol(format!(
            "{telecom} answered {} of {} tokens",
            response.responses.len(),
            batch.len()
        )));
    }
    Ok(())
}
