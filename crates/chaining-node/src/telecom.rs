//! Telecom server.
//!
//! Listens for Leader connections and answers each [`BatchQuery`] with a
//! signed [`ResponseBatch`]. Every connection is its own [`Session`], so
//! the already-sent set starts empty on reconnect.
//!
//! # Protocol Flow
//!
//! ```text
//! Leader                      Telecom
//!   │  BatchQuery               │
//!   │──────────────────────────>│  verify agency signatures
//!   │                           │  worker pool per batch
//!   │            ResponseBatch  │
//!   │<──────────────────────────│
//!   │          ... repeat ...   │
//!   │  close                    │
//! ```
//!
//! A batch that fails the signature check gets one `InvalidSignature`
//! response, after which the connection is closed.

use std::{net::SocketAddr, sync::Arc};

use chaining_core::{Environment, GraphPartition, KeyStore, Responder, Session, TelecomConfig};
use chaining_proto::{BatchQuery, PartyId};
use tokio::net::TcpListener;

use crate::{NodeError, transport::Connection};

/// A bound telecom server.
pub struct TelecomServer<E: Environment> {
    listener: TcpListener,
    responder: Responder,
    env: E,
}

impl<E: Environment> TelecomServer<E> {
    /// Load keys and graph and bind the listen address.
    pub async fn bind(config: &TelecomConfig, env: E) -> Result<Self, NodeError> {
        let me = PartyId::Telecom(config.id);
        let keys = KeyStore::load(&config.key_dir, me, config.topology)?;
        let graph = GraphPartition::load(&config.graph)?;
        tracing::info!(telecom = %config.id, users = graph.len(), "graph partition loaded");

        let workers = config.effective_workers();
        let responder = Responder::new(config.id, Arc::new(keys), Arc::new(graph), workers);
        Self::with_responder(&config.listen, responder, env).await
    }

    /// Bind with an already constructed responder.
    pub async fn with_responder(
        listen: &str,
        responder: Responder,
        env: E,
    ) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self { listener, responder, env })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    ///
    /// Connections are served one at a time.
    pub async fn run(self) -> Result<(), NodeError> {
        let addr = self.local_addr()?;
        tracing::info!(telecom = %self.responder.id(), %addr, "telecom listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    if let Err(e) = serve_connection(stream, &self.responder, &self.env).await {
                        tracing::error!(error = %e, "leader connection failed");
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                },
            }
        }
    }
}

async fn serve_connection<E: Environment>(
    stream: tokio::net::TcpStream,
    responder: &Responder,
    env: &E,
) -> Result<(), NodeError> {
    let mut conn = Connection::new(stream)?;
    let peer = conn.peer();
    let mut session = Session::new();
    tracing::info!(%peer, "leader connected");

    while let Some(batch) = conn.recv_optional::<BatchQuery>().await? {
        let worker = responder.clone();
        let mut rng = env.rng();

        let (returned, response) = tokio::task::spawn_blocking(move || {
            let response = worker.respond(&mut session, &batch, &mut rng);
            (session, response)
        })
        .await?;
        session = returned;

        let response = response?;
        let rejected = response.is_rejected();
        conn.send(&response).await?;

        if rejected {
            tracing::warn!(%peer, "closing connection after rejected batch");
            conn.shutdown().await?;
            return Ok(());
        }
    }

    tracing::info!(
        %peer,
        batches = session.batches(),
        disclosed = session.sent_count(),
        bytes_received = conn.bytes_received(),
        bytes_sent = conn.bytes_sent(),
        "leader disconnected"
    );
    Ok(())
}
