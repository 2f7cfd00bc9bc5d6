//! Reversible embedding of user ids into the Ristretto group.
//!
//! ElGamal encrypts group elements, not integers, so every id is first mapped
//! to a point by try-and-increment over a fixed encoding layout:
//!
//! ```text
//! byte  0       : 0x00 (keeps the field element non-negative)
//! bytes 1..9    : id, little-endian
//! bytes 9..11   : counter, little-endian
//! bytes 11..32  : 0x00
//! ```
//!
//! The first counter whose bytes decode as a canonical Ristretto encoding is
//! used. Decoding is the inverse: compress the point and read the id back out
//! of the layout.
//!
//! # Invariants
//!
//! - `extract(embed(id)) == id` for every id that embeds
//! - `extract` rejects any point whose encoding does not follow the layout

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};

use crate::CryptoError;

const ID_OFFSET: usize = 1;
const COUNTER_OFFSET: usize = 9;
const PADDING_OFFSET: usize = 11;

/// Map a user id to a group element.
pub fn embed(id: u64) -> Result<RistrettoPoint, CryptoError> {
    let mut bytes = [0u8; 32];
    bytes[ID_OFFSET..COUNTER_OFFSET].copy_from_slice(&id.to_le_bytes());

    for counter in 0..=u16::MAX {
        bytes[COUNTER_OFFSET..PADDING_OFFSET].copy_from_slice(&counter.to_le_bytes());
        if let Some(point) = CompressedRistretto(bytes).decompress() {
            return Ok(point);
        }
    }

    Err(CryptoError::EmbeddingExhausted { id })
}

/// Recover the user id from an embedded group element.
pub fn extract(point: &RistrettoPoint) -> Result<u64, CryptoError> {
    let bytes = point.compress().to_bytes();

    if bytes[0] != 0 || bytes[PADDING_OFFSET..].iter().any(|&b| b != 0) {
        return Err(CryptoError::NotAnIdentity);
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[ID_OFFSET..COUNTER_OFFSET]);
    Ok(u64::from_le_bytes(id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use curve25519_dalek::{constants::RISTRETTO_BASEPOINT_POINT, scalar::Scalar};

    use super::*;

    #[test]
    fn embed_then_extract_recovers_id() {
        for id in [0, 1, 2, 42, 1 << 40, u64::MAX] {
            let point = embed(id).unwrap();
            assert_eq!(extract(&point).unwrap(), id);
        }
    }

    #[test]
    fn distinct_ids_embed_to_distinct_points() {
        assert_ne!(embed(7).unwrap(), embed(8).unwrap());
    }

    #[test]
    fn extract_rejects_arbitrary_point() {
        let point = RISTRETTO_BASEPOINT_POINT * Scalar::from(12_345u64);
        assert_eq!(extract(&point), Err(CryptoError::NotAnIdentity));
    }
}
