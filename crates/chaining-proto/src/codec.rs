//! Length-prefixed, versioned CBOR framing.
//!
//! [`encode_frame`] produces a complete frame. Readers either pull the
//! 4-byte prefix themselves and call [`frame_length`] + [`decode_payload`], or
//! feed arbitrary chunks into a [`FrameDecoder`].
//!
//! # Invariants
//!
//! - A declared length above [`MAX_FRAME_SIZE`] is rejected before any
//!   payload byte is buffered
//! - A frame with a version other than [`WIRE_VERSION`] is never decoded

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::ProtoError;

/// Schema version carried in every frame.
pub const WIRE_VERSION: u8 = 1;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted frame (version byte plus body).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encode `message` as a complete frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, ProtoError> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(message, &mut body)
        .map_err(|e| ProtoError::Encode { reason: e.to_string() })?;

    let len = body.len() + 1;
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
    // Bounded by MAX_FRAME_SIZE above.
    #[allow(clippy::cast_possible_truncation)]
    out.put_u32(len as u32);
    out.put_u8(WIRE_VERSION);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Validate a length prefix and return the payload size it announces.
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtoError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(ProtoError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    Ok(len)
}

/// Decode a frame payload (version byte plus body).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtoError> {
    let (&version, body) = payload.split_first().ok_or(ProtoError::EmptyFrame)?;
    if version != WIRE_VERSION {
        return Err(ProtoError::UnsupportedVersion { version, expected: WIRE_VERSION });
    }
    ciborium::de::from_reader(body).map_err(|e| ProtoError::Decode { reason: e.to_string() })
}

/// Incremental decoder for a byte stream of frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// On error the decoder is left in an unspecified position; the stream
    /// should be dropped.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtoError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = frame_length(prefix)?;

        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buffer.split_to(len);
        decode_payload(&payload).map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{AgencyId, OversightMessage};

    #[test]
    fn frame_carries_length_and_version() {
        let frame = encode_frame(&OversightMessage::Hello { agency: AgencyId(2) }).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

        assert_eq!(len, frame.len() - LENGTH_PREFIX_SIZE);
        assert_eq!(frame[LENGTH_PREFIX_SIZE], WIRE_VERSION);
    }

    #[test]
    fn decoder_waits_for_complete_frame() {
        let frame = encode_frame(&OversightMessage::Hello { agency: AgencyId(1) }).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..frame.len() - 1]);
        assert_eq!(decoder.next_frame::<OversightMessage>().unwrap(), None);

        decoder.extend(&frame[frame.len() - 1..]);
        assert_eq!(
            decoder.next_frame::<OversightMessage>().unwrap(),
            Some(OversightMessage::Hello { agency: AgencyId(1) })
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_splits_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&OversightMessage::Hello { agency: AgencyId(1) }).unwrap());
        decoder.extend(&encode_frame(&OversightMessage::Hello { agency: AgencyId(2) }).unwrap());

        let first: OversightMessage = decoder.next_frame().unwrap().unwrap();
        let second: OversightMessage = decoder.next_frame().unwrap().unwrap();
        assert_eq!(first, OversightMessage::Hello { agency: AgencyId(1) });
        assert_eq!(second, OversightMessage::Hello { agency: AgencyId(2) });
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let prefix = u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes();
        assert!(matches!(frame_length(prefix), Err(ProtoError::FrameTooLarge { .. })));
    }

    #[test]
    fn zero_length_prefix_is_rejected() {
        assert_eq!(frame_length([0; 4]), Err(ProtoError::EmptyFrame));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let frame = encode_frame(&OversightMessage::Hello { agency: AgencyId(1) }).unwrap();
        let mut payload = frame[LENGTH_PREFIX_SIZE..].to_vec();
        payload[0] = WIRE_VERSION + 1;

        let err = decode_payload::<OversightMessage>(&payload).unwrap_err();
        assert_eq!(
            err,
            ProtoError::UnsupportedVersion { version: WIRE_VERSION + 1, expected: WIRE_VERSION }
        );
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let payload = [WIRE_VERSION, 0xff, 0x00, 0x13];
        let result = decode_payload::<OversightMessage>(&payload);
        assert!(matches!(result, Err(ProtoError::Decode { .. })));
    }
}
