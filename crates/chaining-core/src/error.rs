//! Core error types.

use std::{io, path::PathBuf};

use chaining_crypto::CryptoError;
use chaining_proto::{AgencyId, PartyId, ProtoError, TelecomId};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors from running any protocol role.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Configuration could not be loaded or is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Key material missing or malformed.
    #[error("key error for {party} at {}: {reason}", path.display())]
    Key {
        /// Party whose key failed to load.
        party: PartyId,
        /// File that was being read.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A signature was missing or did not verify.
    #[error("signature from {signer} rejected: {context}")]
    Signature {
        /// Party whose signature was rejected.
        signer: PartyId,
        /// What was being verified.
        context: String,
    },

    /// A telecom refused a batch because its signatures did not verify.
    #[error("{telecom} rejected the batch signatures")]
    RejectedByTelecom {
        /// Rejecting telecom.
        telecom: TelecomId,
    },

    /// An Oversight agency refused to co-sign.
    #[error("{agency} refused: {reason}")]
    Refused {
        /// Refusing agency.
        agency: AgencyId,
        /// Reason it gave.
        reason: String,
    },

    /// The run diverged from what was authorized.
    #[error("audit failed: {reason}")]
    Audit {
        /// Why the audit failed.
        reason: String,
    },

    /// Could not reach a peer.
    #[error("connection to {peer} failed: {reason}")]
    Connection {
        /// Address or party that could not be reached.
        peer: String,
        /// Description of the failure.
        reason: String,
    },

    /// A peer sent something the protocol does not allow here.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtoError),

    /// Filesystem or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    /// Shorthand for [`ChainError::Protocol`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    /// Returns true if this error must end the run.
    ///
    /// Only connection establishment is retried; everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection { .. } => false,

            Self::Config(_)
            | Self::Key { .. }
            | Self::Crypto(_)
            | Self::Signature { .. }
            | Self::RejectedByTelecom { .. }
            | Self::Refused { .. }
            | Self::Audit { .. }
            | Self::Protocol { .. }
            | Self::Codec(_)
            | Self::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_is_transient() {
        let err = ChainError::Connection {
            peer: "127.0.0.1:9000".to_string(),
            reason: "refused".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn signature_is_fatal() {
        let err = ChainError::Signature {
            signer: PartyId::Telecom(TelecomId(1)),
            context: "response".to_string(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn error_display() {
        let err =
            ChainError::Refused { agency: AgencyId(2), reason: "target mismatch".to_string() };
        assert_eq!(err.to_string(), "agency-2 refused: target mismatch");

        let err = ChainError::RejectedByTelecom { telecom: TelecomId(0) };
        assert_eq!(err.to_string(), "telecom-0 rejected the batch signatures");
    }
}
