//! Networked contact chaining roles.
//!
//! This crate runs the role logic from `chaining-core` over TCP using:
//! - Tokio for the async runtime and sockets
//! - `futures::try_join_all` for Oversight fan-out barriers
//! - System time and OS-seeded randomness
//!
//! ## Architecture
//!
//! ```text
//! chaining-node
//!   ├─ SystemEnv       (production Environment impl)
//!   ├─ Connection      (length-prefixed CBOR frames over TCP)
//!   ├─ TelecomServer   (signature gate + worker pool per batch)
//!   ├─ Leader          (drives rounds, collects co-signatures)
//!   ├─ Oversight       (replays rounds, co-signs, audits)
//!   └─ output          (result and timing files)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod leader;
pub mod output;
mod oversight;
mod system_env;
mod telecom;
pub mod transport;

pub use error::NodeError;
pub use leader::Leader;
pub use oversight::Oversight;
pub use system_env::SystemEnv;
pub use telecom::TelecomServer;
pub use transport::{Connection, connect_with_retry};
