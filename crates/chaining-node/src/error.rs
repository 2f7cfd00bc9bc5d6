//! Node error types.

use std::fmt;

use chaining_core::{ChainError, ConfigError};
use chaining_proto::ProtoError;

/// Errors that can occur while running a role over the network.
#[derive(Debug)]
pub enum NodeError {
    /// Protocol or configuration failure from the role logic
    Chain(ChainError),

    /// Transport/network error
    Transport(String),

    /// Malformed frame on the wire
    Codec(ProtoError),

    /// Internal error
    Internal(String),
}

impl NodeError {
    /// Returns true if the run could succeed if restarted unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Chain(err) => !err.is_fatal(),
            Self::Transport(_) => true,
            Self::Codec(_) | Self::Internal(_) => false,
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chain(err) => write!(f, "{err}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Codec(err) => write!(f, "codec error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Chain(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::Transport(_) | Self::Internal(_) => None,
        }
    }
}

impl From<ChainError> for NodeError {
    fn from(err: ChainError) -> Self {
        Self::Chain(err)
    }
}

impl From<ConfigError> for NodeError {
    fn from(err: ConfigError) -> Self {
        Self::Chain(ChainError::Config(err))
    }
}

impl From<ProtoError> for NodeError {
    fn from(err: ProtoError) -> Self {
        Self::Codec(err)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(err.to_string())
    }
}
