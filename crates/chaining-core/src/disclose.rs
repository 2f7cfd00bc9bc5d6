//! Joint disclosure of agency-ciphertexts.
//!
//! An agency-ciphertext carries one layer per agency. Each agency strips its
//! own layer with [`strip_layer`], in any order; once every layer is gone,
//! [`reveal`] yields the user id.

use chaining_crypto::LayeredCiphertext;
use chaining_proto::{AgencyCiphertext, UserId};

use crate::{ChainError, KeyStore};

/// Remove the key holder's layer.
pub fn strip_layer(
    keys: &KeyStore,
    value: &AgencyCiphertext,
) -> Result<AgencyCiphertext, ChainError> {
    let layered = LayeredCiphertext::from_bytes(&value.0)?;
    Ok(AgencyCiphertext(keys.decrypt_own_layer(layered)?.to_bytes()))
}

/// Recover the user id from a fully stripped ciphertext.
pub fn reveal(value: &AgencyCiphertext) -> Result<UserId, ChainError> {
    Ok(LayeredCiphertext::from_bytes(&value.0)?.reveal()?)
}

/// Number of agency layers still applied to `value`.
pub fn layers_remaining(value: &AgencyCiphertext) -> Result<usize, ChainError> {
    Ok(LayeredCiphertext::from_bytes(&value.0)?.layers().count())
}

/// Strip every agency's layer in the order given, then reveal.
pub fn disclose(agencies: &[&KeyStore], value: &AgencyCiphertext) -> Result<UserId, ChainError> {
    let mut current = value.clone();
    for keys in agencies {
        current = strip_layer(keys, &current)?;
    }
    reveal(&current)
}
