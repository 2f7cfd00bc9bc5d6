//! Oversight agency.
//!
//! Replays the Leader's search from wire data alone. Every batch the Leader
//! asks it to sign is rebuilt locally from the signed telecom responses; the
//! co-signature is produced over the local copy, so a Leader that queried
//! anything else ends up with a signature the telecoms reject.
//!
//! Any mismatch is answered with `Refusal` and ends the run.
//!
//! The CPU time reported in `Audit` is the thread CPU time spent handling
//! Leader messages, not time spent waiting on the socket.

use std::time::Duration;

use chaining_core::{
    ChainError, ChainState, Environment, KeyStore, OversightConfig, Role, RunReport,
};
use chaining_proto::{AgencyId, AuditOutcome, LeaderMessage, OversightMessage, PartyId};
use cpu_time::ThreadTime;

use crate::{
    NodeError, output,
    transport::{Connection, connect_with_retry},
};

/// A configured Oversight agency.
pub struct Oversight<E: Environment> {
    config: OversightConfig,
    keys: KeyStore,
    env: E,
}

impl<E: Environment> Oversight<E> {
    /// Load this agency's keys.
    pub fn new(config: OversightConfig, env: E) -> Result<Self, NodeError> {
        let me = PartyId::Agency(config.agency);
        let keys = KeyStore::load(&config.key_dir, me, config.topology)?;
        Self::with_keys(config, keys, env)
    }

    /// Use an already loaded key store.
    pub fn with_keys(
        config: OversightConfig,
        keys: KeyStore,
        env: E,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        Ok(Self { config, keys, env })
    }

    /// This agency's id.
    pub fn agency(&self) -> AgencyId {
        self.config.agency
    }

    /// Connect to the Leader and audit one search.
    pub async fn run(self) -> Result<RunReport, NodeError> {
        let params = self.config.search;
        let agency = self.config.agency;
        let mut report = RunReport::default();

        let setup_start = self.env.now();
        let mut conn =
            connect_with_retry(&self.env, &self.config.leader, self.config.retry).await?;
        conn.send(&OversightMessage::Hello { agency }).await?;

        match conn.recv::<LeaderMessage>().await? {
            LeaderMessage::Target { target } if target == params.target => {},
            LeaderMessage::Target { target } => {
                let reason = format!(
                    "leader target {target} differs from authorized target {}",
                    params.target
                );
                return Err(refuse(&mut conn, ChainError::Audit { reason }).await);
            },
            other => {
                return Err(ChainError::protocol(format!("expected Target, got {other:?}")).into());
            },
        }
        report.setup_time = self.env.now().duration_since(setup_start);
        tracing::info!(%agency, target_user = params.target, "connected to leader");

        let protocol_start = self.env.now();
        let mut cpu = Duration::ZERO;
        let mut state = ChainState::new(Role::Oversight(agency), params, self.config.topology);

        loop {
            let message = conn.recv::<LeaderMessage>().await?;
            // `ThreadTime` is !Send; keep it out of scope across awaits.
            let (step, elapsed) = {
                let started = ThreadTime::now();
                let step = self.step(&mut state, message, &mut report);
                (step, started.elapsed())
            };

            let reply = match step {
                Ok(reply) => reply,
                Err(e) => return Err(refuse(&mut conn, e).await),
            };
            cpu += elapsed;

            let done = matches!(reply, OversightMessage::Audit { .. });
            let reply = match reply {
                OversightMessage::Audit { outcome, .. } => {
                    report.audits.insert(agency, outcome.clone());
                    OversightMessage::Audit {
                        outcome,
                        cpu_time_nanos: nanos(cpu),
                    }
                },
                other => other,
            };
            conn.send(&reply).await?;
            if done {
                break;
            }
        }

        report.protocol_time = self.env.now().duration_since(protocol_start);
        report.add_agency_cpu(nanos(cpu));
        report.bytes_sent = conn.bytes_sent();
        report.bytes_received = conn.bytes_received();
        report.target_degree = state.target_degree();
        report.outputs = state.into_outputs();

        tracing::info!(
            %agency,
            users = report.outputs.len(),
            rounds = report.rounds,
            "audit finished"
        );

        if let Some(path) = &self.config.output {
            output::write_outputs(path, &params, &report.outputs)?;
        }
        if let Some(path) = &self.config.timing_log {
            output::append_timing_record(path, "oversight", &params, &report)?;
        }
        Ok(report)
    }

    /// Handle one Leader message and build the reply.
    fn step(
        &self,
        state: &mut ChainState,
        message: LeaderMessage,
        report: &mut RunReport,
    ) -> Result<OversightMessage, ChainError> {
        match message {
            LeaderMessage::InitialQuery { batch } => {
                state.accept_initial(&batch, &self.keys)?;
                let signature = state
                    .sign_pending(&self.keys)?
                    .remove(&batch.telecom)
                    .ok_or_else(|| ChainError::protocol("initial query not pending"))?;
                tracing::debug!(telecom = %batch.telecom, "initial query co-signed");
                Ok(OversightMessage::InitialSignature { signature })
            },
            LeaderMessage::Round { distance, responses } => {
                let summary = state.absorb(&responses, &self.keys)?;
                report.rounds += 1;
                for response in &responses {
                    report.add_telecom_cpu(response.cpu_time_nanos);
                }

                if state.distance() != distance {
                    return Err(ChainError::Audit {
                        reason: format!(
                            "leader asked to sign distance {distance}, expected {}",
                            state.distance()
                        ),
                    });
                }
                let next = state.next_batches()?;
                if next.is_empty() {
                    return Err(ChainError::Audit {
                        reason: format!(
                            "leader continues at distance {distance} with an empty frontier"
                        ),
                    });
                }

                let signatures = state.sign_pending(&self.keys)?;
                tracing::info!(
                    distance = summary.distance,
                    found = summary.found,
                    batches = signatures.len(),
                    "round co-signed"
                );
                Ok(OversightMessage::RoundSignatures { signatures })
            },
            LeaderMessage::Final { responses } => {
                state.absorb(&responses, &self.keys)?;
                report.rounds += 1;
                for response in &responses {
                    report.add_telecom_cpu(response.cpu_time_nanos);
                }

                let outcome = if state.is_complete() {
                    AuditOutcome::Passed
                } else {
                    let reason = format!(
                        "leader stopped with {} tokens still in the frontier",
                        state.frontier_len()
                    );
                    tracing::error!(%reason, "audit failed");
                    AuditOutcome::Failed { reason }
                };
                Ok(OversightMessage::Audit { outcome, cpu_time_nanos: 0 })
            },
            LeaderMessage::Target { .. } => Err(ChainError::protocol("target sent twice")),
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Tell the Leader why this agency stops, then hand the error back.
async fn refuse(conn: &mut Connection, err: ChainError) -> NodeError {
    let reason = err.to_string();
    tracing::error!(%reason, "refusing to continue");
    if let Err(e) = conn.send(&OversightMessage::Refusal { reason }).await {
        tracing::warn!(error = %e, "refusal could not be delivered");
    }
    err.into()
}
