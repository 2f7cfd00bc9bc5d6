//! Crypto error types.

use thiserror::Error;

/// Errors from cryptographic operations.
///
/// Every variant is fatal to the operation that produced it, never to the
/// process: callers decide whether to abort a run or reject a single item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key material could not be decoded.
    #[error("invalid {kind} key: {reason}")]
    InvalidKey {
        /// Which kind of key was being decoded.
        kind: &'static str,
        /// Description of the decoding failure.
        reason: String,
    },

    /// Ciphertext bytes are malformed.
    #[error("invalid ciphertext: {reason}")]
    InvalidCiphertext {
        /// Description of the decoding failure.
        reason: String,
    },

    /// Tried to strip a layer that is not present.
    #[error("layer {layer} not present in ciphertext")]
    MissingLayer {
        /// The layer that was requested.
        layer: u32,
    },

    /// Tried to reveal a ciphertext that still carries layers.
    #[error("{remaining} layer(s) still applied")]
    LayersRemaining {
        /// Number of layers left on the ciphertext.
        remaining: usize,
    },

    /// No counter value produced a valid group element for this id.
    #[error("could not embed id {id} into the group")]
    EmbeddingExhausted {
        /// The id that could not be embedded.
        id: u64,
    },

    /// Decrypted group element is not an embedded identity.
    ///
    /// Seen when a value is opened with the wrong key.
    #[error("decrypted value is not an embedded identity")]
    NotAnIdentity,
}

impl CryptoError {
    /// Returns true if this error indicates corrupt or hostile input rather
    /// than a caller bug.
    pub fn is_input_error(&self) -> bool {
        match self {
            Self::InvalidKey { .. } | Self::InvalidCiphertext { .. } | Self::NotAnIdentity => true,
            Self::MissingLayer { .. }
            | Self::LayersRemaining { .. }
            | Self::EmbeddingExhausted { .. } => false,
        }
    }
}
