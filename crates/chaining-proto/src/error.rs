//! Protocol error types.

use thiserror::Error;

/// Errors from encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// CBOR serialization failed.
    #[error("encode failed: {reason}")]
    Encode {
        /// Description of the failure.
        reason: String,
    },

    /// CBOR deserialization failed.
    #[error("decode failed: {reason}")]
    Decode {
        /// Description of the failure.
        reason: String,
    },

    /// Frame carries a schema version this build does not speak.
    #[error("unsupported wire version {version} (expected {expected})")]
    UnsupportedVersion {
        /// Version byte found in the frame.
        version: u8,
        /// Version this build speaks.
        expected: u8,
    },

    /// Frame length exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame length is zero, so there is no version byte.
    #[error("empty frame")]
    EmptyFrame,
}
