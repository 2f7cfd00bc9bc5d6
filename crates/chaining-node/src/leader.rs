//! Leader agency.
//!
//! Drives the search: waits for every Oversight agency, creates the initial
//! query, then alternates between collecting co-signatures and querying
//! telecoms until the frontier is empty.
//!
//! # Protocol Flow
//!
//! ```text
//! AwaitOversight ──► InitialQuery ──► Round(1) ──► ... ──► Round(max) ──► Final
//!   Hello/Target      co-sign,         co-sign,                           audits
//!                     query owner      query telecoms
//! ```
//!
//! Every exchange with the Oversight agencies is a barrier: the message is
//! sent to all of them concurrently and the next step starts only when all
//! have answered. Telecoms of one round are also queried concurrently.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
};

use chaining_core::{
    ChainError, ChainState, Environment, KeyStore, LeaderConfig, Role, RunReport,
};
use chaining_proto::{
    AgencyId, BatchQuery, LeaderMessage, OversightMessage, PartyId, ResponseBatch, TelecomId,
    encode_frame,
};
use futures::future::try_join_all;
use tokio::net::TcpListener;

use crate::{
    NodeError, output,
    transport::{Connection, connect_with_retry},
};

/// A bound Leader agency.
pub struct Leader<E: Environment> {
    config: LeaderConfig,
    keys: KeyStore,
    listener: TcpListener,
    env: E,
}

impl<E: Environment> Leader<E> {
    /// Load the Leader's keys and bind the Oversight listen address.
    pub async fn bind(config: LeaderConfig, env: E) -> Result<Self, NodeError> {
        let party = PartyId::Agency(AgencyId::LEADER);
        let keys = KeyStore::load(&config.key_dir, party, config.topology)?;
        Self::with_keys(config, keys, env).await
    }

    /// Bind with an already loaded key store.
    pub async fn with_keys(
        config: LeaderConfig,
        keys: KeyStore,
        env: E,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Self { config, keys, listener, env })
    }

    /// Address Oversight agencies connect to.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run one search to completion.
    pub async fn run(self) -> Result<RunReport, NodeError> {
        let params = self.config.search;
        let mut report = RunReport::default();

        let setup_start = self.env.now();
        let mut oversight = self.await_oversight().await?;
        report.setup_time = self.env.now().duration_since(setup_start);

        tracing::info!(
            target_user = params.target,
            max_distance = params.max_distance,
            max_degree = params.max_degree,
            oversight = oversight.len(),
            "search starting"
        );

        let protocol_start = self.env.now();
        let mut telecoms = TelecomLinks::new(&self.config, &self.env);
        let mut state = ChainState::new(Role::Leader, params, self.config.topology);
        let mut rng = self.env.rng();

        let initial = state.begin(&self.keys, &mut rng)?;
        state.sign_own(&self.keys)?;
        let signed = state
            .pending()
            .get(&initial.telecom)
            .cloned()
            .ok_or_else(|| NodeError::Internal("initial query not pending".to_string()))?;

        let query = LeaderMessage::InitialQuery { batch: signed };
        for (agency, reply) in fan_out(&mut oversight, &query).await? {
            match reply {
                OversightMessage::InitialSignature { signature } => {
                    let signatures = BTreeMap::from([(initial.telecom, signature)]);
                    state.attach_signatures(agency, &signatures, &self.keys)?;
                },
                other => return Err(unexpected_reply(agency, other, "InitialSignature")),
            }
        }

        loop {
            let responses = telecoms.dispatch(state.pending()).await?;
            for response in &responses {
                report.add_telecom_cpu(response.cpu_time_nanos);
            }

            let summary = state.absorb(&responses, &self.keys)?;
            report.rounds += 1;
            tracing::info!(
                distance = summary.distance,
                found = summary.found,
                not_found = summary.not_found,
                already_sent = summary.already_sent,
                next = summary.admitted,
                "round complete"
            );

            let next = state.next_batches()?;
            if next.is_empty() {
                let replies = fan_out(&mut oversight, &LeaderMessage::Final { responses }).await?;
                for (agency, reply) in replies {
                    match reply {
                        OversightMessage::Audit { outcome, cpu_time_nanos } => {
                            if outcome.is_passed() {
                                tracing::info!(%agency, "audit passed");
                            } else {
                                tracing::error!(%agency, ?outcome, "audit failed");
                            }
                            report.add_agency_cpu(cpu_time_nanos);
                            report.audits.insert(agency, outcome);
                        },
                        other => return Err(unexpected_reply(agency, other, "Audit")),
                    }
                }
                break;
            }

            state.sign_own(&self.keys)?;
            let round = LeaderMessage::Round { distance: state.distance(), responses };
            for (agency, reply) in fan_out(&mut oversight, &round).await? {
                match reply {
                    OversightMessage::RoundSignatures { signatures } => {
                        state.attach_signatures(agency, &signatures, &self.keys)?;
                    },
                    other => return Err(unexpected_reply(agency, other, "RoundSignatures")),
                }
            }
        }

        report.protocol_time = self.env.now().duration_since(protocol_start);
        for conn in oversight.values().chain(telecoms.links.values()) {
            report.bytes_sent += conn.bytes_sent();
            report.bytes_received += conn.bytes_received();
        }
        report.target_degree = state.target_degree();
        report.outputs = state.into_outputs();

        tracing::info!(users = report.outputs.len(), rounds = report.rounds, "search finished");
        if !report.all_audits_passed() {
            tracing::warn!("at least one Oversight agency failed the audit");
        }

        if let Some(path) = &self.config.output {
            output::write_outputs(path, &params, &report.outputs)?;
        }
        if let Some(path) = &self.config.timing_log {
            output::append_timing_record(path, "leader", &params, &report)?;
        }
        Ok(report)
    }

    fn accepts(&self, agency: AgencyId, links: &BTreeMap<AgencyId, Connection>) -> bool {
        !agency.is_leader()
            && agency.0 < self.config.topology.agencies
            && !links.contains_key(&agency)
    }

    async fn await_oversight(&self) -> Result<BTreeMap<AgencyId, Connection>, NodeError> {
        let expected = self.config.topology.oversight_count() as usize;
        let timeout = self.config.accept_timeout();
        let target = self.config.search.target;
        let mut links = BTreeMap::new();

        let accepting = tokio::time::timeout(timeout, async {
            while links.len() < expected {
                let (stream, peer) = self.listener.accept().await?;
                let mut conn = Connection::new(stream)?;

                match conn.recv::<OversightMessage>().await {
                    Ok(OversightMessage::Hello { agency }) if self.accepts(agency, &links) => {
                        conn.send(&LeaderMessage::Target { target }).await?;
                        tracing::info!(%agency, %peer, "oversight connected");
                        links.insert(agency, conn);
                    },
                    Ok(OversightMessage::Hello { agency }) => {
                        tracing::warn!(%agency, %peer, "dropping unknown or duplicate agency");
                    },
                    Ok(other) => {
                        tracing::warn!(
                            %peer,
                            message = ?other,
                            "dropping connection without handshake"
                        );
                    },
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "handshake failed");
                    },
                }
            }
            Ok::<_, NodeError>(())
        })
        .await;

        match accepting {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChainError::Connection {
                    peer: "oversight agencies".to_string(),
                    reason: format!("{} of {expected} connected within {timeout:?}", links.len()),
                }
                .into());
            },
        }
        Ok(links)
    }
}

/// Send one message to every Oversight agency and wait for all replies.
async fn fan_out(
    links: &mut BTreeMap<AgencyId, Connection>,
    message: &LeaderMessage,
) -> Result<Vec<(AgencyId, OversightMessage)>, NodeError> {
    let frame = encode_frame(message)?;
    let frame = &frame;

    try_join_all(links.iter_mut().map(|(&agency, conn)| async move {
        conn.send_frame(frame).await?;
        let reply: OversightMessage = conn.recv().await?;
        Ok::<_, NodeError>((agency, reply))
    }))
    .await
}

fn unexpected_reply(agency: AgencyId, reply: OversightMessage, expected: &str) -> NodeError {
    match reply {
        OversightMessage::Refusal { reason } => {
            tracing::error!(%agency, %reason, "oversight refused");
            ChainError::Refused { agency, reason }.into()
        },
        other => {
            ChainError::protocol(format!("{agency} sent {other:?}, expected {expected}")).into()
        },
    }
}

/// Lazily opened connections to telecoms.
struct TelecomLinks<'a, E: Environment> {
    config: &'a LeaderConfig,
    env: &'a E,
    links: BTreeMap<TelecomId, Connection>,
    unhinted: BTreeSet<TelecomId>,
}

impl<'a, E: Environment> TelecomLinks<'a, E> {
    fn new(config: &'a LeaderConfig, env: &'a E) -> Self {
        Self { config, env, links: BTreeMap::new(), unhinted: BTreeSet::new() }
    }

    async fn connect(&mut self, telecom: TelecomId) -> Result<(), NodeError> {
        let address = self
            .config
            .telecom_address(telecom)
            .ok_or_else(|| ChainError::protocol(format!("no address for {telecom}")))?;
        let conn = connect_with_retry(self.env, address, self.config.retry).await?;
        tracing::debug!(%telecom, address, "telecom connected");

        self.links.insert(telecom, conn);
        self.unhinted.insert(telecom);
        Ok(())
    }

    /// Send every pending batch and collect the responses in telecom order.
    ///
    /// The first batch on each connection carries the degree hint.
    async fn dispatch(
        &mut self,
        pending: &BTreeMap<TelecomId, BatchQuery>,
    ) -> Result<Vec<ResponseBatch>, NodeError> {
        for &telecom in pending.keys() {
            if !self.links.contains_key(&telecom) {
                self.connect(telecom).await?;
            }
        }

        let max_degree = self.config.search.max_degree;
        let unhinted = &mut self.unhinted;
        let requests: Vec<_> = self
            .links
            .iter_mut()
            .filter_map(|(telecom, conn)| {
                let mut batch = pending.get(telecom)?.clone();
                if unhinted.remove(telecom) {
                    batch.set_max_degree(max_degree);
                }
                Some(async move {
                    conn.send(&batch).await?;
                    let response: ResponseBatch = conn.recv().await?;
                    Ok::<_, NodeError>(response)
                })
            })
            .collect();

        try_join_all(requests).await
    }
}
