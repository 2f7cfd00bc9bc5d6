//! Contact Chaining Core
//!
//! Protocol logic shared by every role: key store, configuration, graph
//! partitions, the admission rule and frontier, the round state machine used
//! by the Leader and Oversight agencies, and the telecom batch responder.
//!
//! # Design
//!
//! Nothing in this crate touches a socket. Role drivers in `chaining-node`
//! move bytes; this crate decides what the bytes mean and what to send next.
//! That keeps the state machine and the responder testable in-process with
//! seeded RNGs.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod chain;
pub mod config;
pub mod disclose;
pub mod env;
pub mod error;
pub mod frontier;
pub mod graph;
pub mod keys;
pub mod report;
pub mod responder;

pub use chain::{ChainState, Role, RoleCapability, RoundSummary};
pub use config::{
    ConfigError, LeaderConfig, OversightConfig, RetryPolicy, SearchParams, TelecomConfig,
    TelecomEndpoint, Topology,
};
pub use env::Environment;
pub use error::ChainError;
pub use frontier::{Admission, Frontier, Suppressed, admit};
pub use graph::{
    DataGenParams, DegreeModel, GraphPartition, generate_graph, partition_path, read_edge_list,
};
pub use keys::{KeyKind, KeyMaterial, KeyStore, key_path};
pub use report::RunReport;
pub use responder::{MAX_WORKERS_ALLOWED, MIN_ITEMS_PER_WORKER, Responder, Session};
