//! Commutative layered encryption.
//!
//! A [`LayeredCiphertext`] holds a masked body and one ephemeral point per
//! layer:
//!
//! ```text
//! body   = M + r_1·H_1 + r_2·H_2 + ... + r_n·H_n
//! layers = { 1: r_1·G, 2: r_2·G, ..., n: r_n·G }
//! ```
//!
//! Adding a layer adds `r·H_i` to the body and records `r·G` under `i`.
//! Removing a layer subtracts `x_i·(r_i·G)` from the body. Point addition is
//! commutative, so the order in which layers are added or removed never
//! matters.
//!
//! # Invariants
//!
//! - Any permutation of `layer_encrypt` calls followed by any permutation of
//!   `layer_decrypt` calls over the same layer set recovers the embedded id
//! - [`LayeredCiphertext::reveal`] succeeds only when no layers remain
//! - Layering the same id twice under one layer re-randomizes the existing
//!   layer instead of adding a second one

use std::collections::BTreeMap;

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use rand::{CryptoRng, RngCore};

use crate::{CryptoError, PublicKey, SecretKey, embed, extract, sealed::decode_point};

/// Identifies the party that owns a layer.
pub type LayerId = u32;

const HEADER_SIZE: usize = 32 + 4;
const LAYER_SIZE: usize = 4 + 32;

/// A user id under zero or more independent encryption layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayeredCiphertext {
    body: RistrettoPoint,
    layers: BTreeMap<LayerId, RistrettoPoint>,
}

impl LayeredCiphertext {
    /// Wrap an id with no layers applied.
    pub fn new(id: u64) -> Result<Self, CryptoError> {
        Ok(Self { body: embed(id)?, layers: BTreeMap::new() })
    }

    /// Add (or re-randomize) the layer for `layer` under `key`.
    pub fn layer_encrypt(
        mut self,
        layer: LayerId,
        key: &PublicKey,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Self {
        let r = Scalar::random(rng);
        self.body += r * key.0;
        let ephemeral = RistrettoPoint::mul_base(&r);
        self.layers.entry(layer).and_modify(|existing| *existing += ephemeral).or_insert(ephemeral);
        self
    }

    /// Remove the layer for `layer` with its secret key.
    pub fn layer_decrypt(mut self, layer: LayerId, key: &SecretKey) -> Result<Self, CryptoError> {
        let ephemeral = self.layers.remove(&layer).ok_or(CryptoError::MissingLayer { layer })?;
        self.body -= key.0 * ephemeral;
        Ok(self)
    }

    /// Recover the id once every layer has been removed.
    pub fn reveal(&self) -> Result<u64, CryptoError> {
        if !self.layers.is_empty() {
            return Err(CryptoError::LayersRemaining { remaining: self.layers.len() });
        }
        extract(&self.body)
    }

    /// Layers still applied, in ascending order.
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.keys().copied()
    }

    /// Returns true if `layer` is still applied.
    pub fn has_layer(&self, layer: LayerId) -> bool {
        self.layers.contains_key(&layer)
    }

    /// Wire encoding: body, layer count (u32 BE), then `(id u32 BE, point)`
    /// per layer in ascending id order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.layers.len() * LAYER_SIZE);
        out.extend_from_slice(self.body.compress().as_bytes());
        // Layer count is bounded by the number of agencies, far below u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.layers.len() as u32).to_be_bytes());
        for (layer, ephemeral) in &self.layers {
            out.extend_from_slice(&layer.to_be_bytes());
            out.extend_from_slice(ephemeral.compress().as_bytes());
        }
        out
    }

    /// Decode a layered ciphertext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CryptoError::InvalidCiphertext {
                reason: format!("need at least {HEADER_SIZE} bytes, got {}", bytes.len()),
            });
        }

        let body = decode_point(&bytes[..32])?;
        let count = read_u32(&bytes[32..HEADER_SIZE]) as usize;
        let rest = &bytes[HEADER_SIZE..];

        if rest.len() != count.saturating_mul(LAYER_SIZE) {
            return Err(CryptoError::InvalidCiphertext {
                reason: format!("expected {count} layers, found {} trailing bytes", rest.len()),
            });
        }

        let mut layers = BTreeMap::new();
        for chunk in rest.chunks_exact(LAYER_SIZE) {
            let layer = read_u32(&chunk[..4]);
            if layers.insert(layer, decode_point(&chunk[4..])?).is_some() {
                let reason = format!("duplicate layer {layer}");
                return Err(CryptoError::InvalidCiphertext { reason });
            }
        }

        Ok(Self { body, layers })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}
