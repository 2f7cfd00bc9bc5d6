//! Telecom batch responder and worker pool.
//!
//! A [`Responder`] answers one [`BatchQuery`] at a time for one
//! [`Session`] (one Leader connection). Per-token work is dominated by
//! public-key crypto, so a batch is cut into contiguous slices that run on
//! scoped worker threads; their results are concatenated in slice order.
//!
//! # Invariants
//!
//! - A batch lacking any agency signature yields exactly one
//!   `InvalidSignature` response and no per-token work
//! - Each user is disclosed at most once per session: the check-and-mark on
//!   the session's sent set is a single locked operation
//! - Response order equals token order regardless of worker count
//! - Worker count is `min(max_workers, ceil(n / MIN_ITEMS_PER_WORKER))`,
//!   never zero, never above [`MAX_WORKERS_ALLOWED`]
//! - `cpu_time_nanos` is thread CPU time: the calling thread's plus every
//!   worker's

use std::{collections::HashSet, sync::Arc, thread, time::Duration};

use chaining_proto::{
    AgencyId, BatchQuery, IdentityToken, PartyId, QueryType, ResponseBatch, TelecomId,
    TokenResponse, UserId, owner_of,
};
use cpu_time::ThreadTime;
use parking_lot::Mutex;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{ChainError, KeyStore, graph::GraphPartition};

/// Smallest slice worth a dedicated worker.
pub const MIN_ITEMS_PER_WORKER: usize = 10;

/// Hard cap on workers per batch.
pub const MAX_WORKERS_ALLOWED: usize = 16;

/// Responses of one worker slice and the CPU time it took.
type WorkerResult = Result<(Vec<TokenResponse>, Duration), ChainError>;

/// Per-connection telecom state.
///
/// A new Leader connection starts a new session: an empty sent set and no
/// degree hint.
#[derive(Debug, Default)]
pub struct Session {
    already_sent: Mutex<HashSet<UserId>>,
    max_degree: Option<u32>,
    batches: u64,
}

impl Session {
    /// Fresh session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `user` as sent. Returns false if it already was.
    pub fn check_and_mark(&self, user: UserId) -> bool {
        self.already_sent.lock().insert(user)
    }

    /// Number of users disclosed on this session.
    pub fn sent_count(&self) -> usize {
        self.already_sent.lock().len()
    }

    /// Degree hint received on this session, if any.
    pub fn max_degree(&self) -> Option<u32> {
        self.max_degree
    }

    /// Batches answered on this session.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    fn observe_degree(&mut self, hint: Option<u32>) {
        match (self.max_degree, hint) {
            (None, Some(degree)) => {
                tracing::debug!(max_degree = degree, "degree hint received");
                self.max_degree = Some(degree);
            },
            (Some(current), Some(degree)) => {
                tracing::warn!(
                    current,
                    ignored = degree,
                    "degree hint repeated on the same connection"
                );
            },
            (_, None) => {},
        }
    }
}

/// Answers signed batch queries against one graph partition.
#[derive(Debug, Clone)]
pub struct Responder {
    id: TelecomId,
    keys: Arc<KeyStore>,
    graph: Arc<GraphPartition>,
    max_workers: usize,
}

impl Responder {
    /// Create a responder. `max_workers` is clamped to `1..=MAX_WORKERS_ALLOWED`.
    pub fn new(
        id: TelecomId,
        keys: Arc<KeyStore>,
        graph: Arc<GraphPartition>,
        max_workers: usize,
    ) -> Self {
        Self { id, keys, graph, max_workers: max_workers.clamp(1, MAX_WORKERS_ALLOWED) }
    }

    /// This telecom's id.
    pub fn id(&self) -> TelecomId {
        self.id
    }

    /// Workers used for a batch of `n` tokens.
    pub fn worker_count(&self, n: usize) -> usize {
        n.div_ceil(MIN_ITEMS_PER_WORKER).clamp(1, self.max_workers)
    }

    /// Returns true if every agency signed the batch payload.
    pub fn is_authorized(&self, batch: &BatchQuery) -> Result<bool, ChainError> {
        let payload = batch.signing_payload()?;
        Ok(self.keys.agency_ids().all(|agency| {
            batch
                .signature(agency)
                .is_some_and(|sig| self.keys.verify(PartyId::Agency(agency), &payload, sig))
        }))
    }

    /// Agencies whose signatures `batch` lacks.
    pub fn missing_signatures(&self, batch: &BatchQuery) -> Vec<AgencyId> {
        self.keys.agency_ids().filter(|&agency| batch.signature(agency).is_none()).collect()
    }

    /// Answer one batch.
    ///
    /// Callers must close the connection after sending a rejected response.
    pub fn respond(
        &self,
        session: &mut Session,
        batch: &BatchQuery,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<ResponseBatch, ChainError> {
        let started = ThreadTime::now();
        let digest = batch.digest()?;

        if batch.telecom != self.id || !self.is_authorized(batch)? {
            tracing::warn!(
                telecom = %self.id,
                addressed_to = %batch.telecom,
                missing = ?self.missing_signatures(batch),
                tokens = batch.len(),
                "batch failed signature check"
            );
            let rejected =
                ResponseBatch::new(self.id, digest, vec![TokenResponse::InvalidSignature]);
            return self.finish(rejected, started.elapsed());
        }

        session.observe_degree(batch.max_degree);
        session.batches += 1;

        let workers = self.worker_count(batch.len());
        let (responses, worker_cpu) = if workers == 1 {
            (self.process(session, &batch.tokens, batch.query_type, rng)?, Duration::ZERO)
        } else {
            self.process_parallel(session, batch, workers, rng)?
        };

        tracing::debug!(
            telecom = %self.id,
            tokens = batch.len(),
            workers,
            query_type = ?batch.query_type,
            max_degree = ?session.max_degree,
            "batch answered"
        );
        let response = ResponseBatch::new(self.id, digest, responses);
        self.finish(response, started.elapsed() + worker_cpu)
    }

    fn finish(
        &self,
        mut response: ResponseBatch,
        cpu: Duration,
    ) -> Result<ResponseBatch, ChainError> {
        response.signature = self.keys.sign(&response.signing_payload()?);
        response.cpu_time_nanos = u64::try_from(cpu.as_nanos()).unwrap_or(u64::MAX);
        Ok(response)
    }

    fn process_parallel(
        &self,
        session: &Session,
        batch: &BatchQuery,
        workers: usize,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<(Vec<TokenResponse>, Duration), ChainError> {
        let chunk_size = batch.len().div_ceil(workers);
        let seeds: Vec<[u8; 32]> = (0..workers)
            .map(|_| {
                let mut seed = [0u8; 32];
                rng.fill_bytes(&mut seed);
                seed
            })
            .collect();

        let results: Vec<WorkerResult> = thread::scope(|scope| {
            let handles: Vec<_> = batch
                .tokens
                .chunks(chunk_size)
                .zip(seeds)
                .map(|(slice, seed)| {
                    scope.spawn(move || {
                        let started = ThreadTime::now();
                        let mut worker_rng = ChaCha20Rng::from_seed(seed);
                        self.process(session, slice, batch.query_type, &mut worker_rng)
                            .map(|responses| (responses, started.elapsed()))
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(ChainError::protocol("response worker panicked")))
                })
                .collect()
        });

        let mut responses = Vec::with_capacity(batch.len());
        let mut cpu = Duration::ZERO;
        for result in results {
            let (slice, spent) = result?;
            responses.extend(slice);
            cpu += spent;
        }
        Ok((responses, cpu))
    }

    fn process(
        &self,
        session: &Session,
        tokens: &[IdentityToken],
        query_type: QueryType,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<TokenResponse>, ChainError> {
        tokens.iter().map(|token| self.answer(session, token, query_type, rng)).collect()
    }

    fn answer(
        &self,
        session: &Session,
        token: &IdentityToken,
        query_type: QueryType,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<TokenResponse, ChainError> {
        let user = match self.keys.decrypt_own(token) {
            Ok(user) => user,
            Err(e) => {
                tracing::debug!(error = %e, "token did not open");
                return Ok(TokenResponse::NotFound);
            },
        };

        let Some(neighbors) = self.graph.neighbors(user) else {
            return Ok(TokenResponse::NotFound);
        };
        if !session.check_and_mark(user) {
            return Ok(TokenResponse::AlreadySent);
        }

        let agency_ciphertext = self.keys.encrypt_for_agencies(user, rng)?;
        let neighbors = match query_type {
            QueryType::Search => self.neighbor_tokens(neighbors, rng)?,
            QueryType::Conclude => Vec::new(),
        };
        Ok(TokenResponse::Data { agency_ciphertext, neighbors })
    }

    fn neighbor_tokens(
        &self,
        neighbors: &[UserId],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<IdentityToken>, ChainError> {
        let telecoms = self.keys.topology().telecoms;
        neighbors
            .iter()
            .map(|&neighbor| {
                let owner = owner_of(neighbor, telecoms)
                    .ok_or_else(|| ChainError::protocol("no telecoms"))?;
                self.keys.encrypt_for_telecom(owner, neighbor, rng)
            })
            .collect()
    }
}
