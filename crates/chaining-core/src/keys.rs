//! Identity and key store.
//!
//! Every party holds its own Ed25519 signing key and ElGamal secret, plus
//! the verifying keys of every peer and the ElGamal public keys of every
//! agency and telecom. Keys are pre-provisioned as hex text files:
//!
//! ```text
//! <dir>/agency-0.sign     Ed25519 seed           (private to agency-0)
//! <dir>/agency-0.verify   Ed25519 verifying key
//! <dir>/agency-0.secret   ElGamal secret scalar  (private to agency-0)
//! <dir>/agency-0.public   ElGamal public key
//! <dir>/telecom-0.sign    ...
//! ```
//!
//! A [`KeyStore`] loads only what its owner is allowed to hold.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chaining_crypto::{
    KeyPair, LayeredCiphertext, PublicKey, SealedId, SecretKey, SigningKey, VerifyingKey, sign,
    signing_key_from_bytes, verify, verifying_key_from_bytes,
};
use chaining_proto::{
    AgencyCiphertext, AgencyId, IdentityToken, PartyId, SignatureBytes, TelecomId, UserId,
};
use rand::{CryptoRng, RngCore};

use crate::{ChainError, config::Topology};

/// Kind of key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Ed25519 seed.
    Signing,
    /// Ed25519 verifying key.
    Verifying,
    /// ElGamal secret scalar.
    Secret,
    /// ElGamal public key.
    Public,
}

impl KeyKind {
    fn extension(self) -> &'static str {
        match self {
            Self::Signing => "sign",
            Self::Verifying => "verify",
            Self::Secret => "secret",
            Self::Public => "public",
        }
    }
}

/// Path of `party`'s key file of `kind` under `dir`.
pub fn key_path(dir: &Path, party: PartyId, kind: KeyKind) -> PathBuf {
    dir.join(format!("{party}.{}", kind.extension()))
}

fn all_parties(topology: &Topology) -> impl Iterator<Item = PartyId> + '_ {
    topology.agency_ids().map(PartyId::Agency).chain(topology.telecom_ids().map(PartyId::Telecom))
}

/// One party's private key material.
#[derive(Clone)]
struct PartySecrets {
    signing: SigningKey,
    elgamal: KeyPair,
}

/// Complete key material for a topology, as produced by key generation.
#[derive(Clone)]
pub struct KeyMaterial {
    topology: Topology,
    parties: BTreeMap<PartyId, PartySecrets>,
}

impl KeyMaterial {
    /// Generate fresh keys for every party.
    pub fn generate(topology: Topology, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let parties = all_parties(&topology)
            .map(|party| {
                let secrets = PartySecrets {
                    signing: SigningKey::generate(rng),
                    elgamal: KeyPair::generate(rng),
                };
                (party, secrets)
            })
            .collect();
        Self { topology, parties }
    }

    /// Write every key file into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<(), ChainError> {
        fs::create_dir_all(dir)?;
        for (&party, secrets) in &self.parties {
            write_key(dir, party, KeyKind::Signing, &secrets.signing.to_bytes())?;
            write_key(dir, party, KeyKind::Verifying, secrets.signing.verifying_key().as_bytes())?;
            write_key(dir, party, KeyKind::Secret, &secrets.elgamal.secret.to_bytes())?;
            write_key(dir, party, KeyKind::Public, &secrets.elgamal.public.to_bytes())?;
        }
        tracing::info!(dir = %dir.display(), parties = self.parties.len(), "wrote key files");
        Ok(())
    }

    /// The store `me` would load from a directory written by [`Self::write`].
    pub fn store_for(&self, me: PartyId) -> Result<KeyStore, ChainError> {
        let own = self.parties.get(&me).ok_or_else(|| ChainError::Key {
            party: me,
            path: PathBuf::new(),
            reason: "party not in topology".to_string(),
        })?;

        let mut verifying = BTreeMap::new();
        let mut agency_keys = BTreeMap::new();
        let mut telecom_keys = BTreeMap::new();
        for (&party, secrets) in &self.parties {
            verifying.insert(party, secrets.signing.verifying_key());
            match party {
                PartyId::Agency(id) => agency_keys.insert(id, secrets.elgamal.public),
                PartyId::Telecom(id) => telecom_keys.insert(id, secrets.elgamal.public),
            };
        }

        Ok(KeyStore {
            me,
            topology: self.topology,
            signing: own.signing.clone(),
            secret: own.elgamal.secret.clone(),
            verifying,
            agency_keys,
            telecom_keys,
        })
    }
}

fn write_key(dir: &Path, party: PartyId, kind: KeyKind, bytes: &[u8]) -> Result<(), ChainError> {
    let path = key_path(dir, party, kind);
    fs::write(&path, hex::encode(bytes))?;
    Ok(())
}

/// Key material held by one party.
pub struct KeyStore {
    me: PartyId,
    topology: Topology,
    signing: SigningKey,
    secret: SecretKey,
    verifying: BTreeMap<PartyId, VerifyingKey>,
    agency_keys: BTreeMap<AgencyId, PublicKey>,
    telecom_keys: BTreeMap<TelecomId, PublicKey>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("me", &self.me)
            .field("topology", &self.topology)
            .field("peers", &self.verifying.len())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Load `me`'s keys and every peer's public keys from `dir`.
    ///
    /// Any missing or malformed file is fatal.
    pub fn load(dir: &Path, me: PartyId, topology: Topology) -> Result<Self, ChainError> {
        let signing = read_key(dir, me, KeyKind::Signing, signing_key_from_bytes)?;
        let secret = read_key(dir, me, KeyKind::Secret, SecretKey::from_bytes)?;

        let mut verifying = BTreeMap::new();
        let mut agency_keys = BTreeMap::new();
        let mut telecom_keys = BTreeMap::new();
        for party in all_parties(&topology) {
            let verifying_key = read_key(dir, party, KeyKind::Verifying, verifying_key_from_bytes)?;
            verifying.insert(party, verifying_key);
            let public = read_key(dir, party, KeyKind::Public, PublicKey::from_bytes)?;
            match party {
                PartyId::Agency(id) => agency_keys.insert(id, public),
                PartyId::Telecom(id) => telecom_keys.insert(id, public),
            };
        }

        if public_of(&agency_keys, &telecom_keys, me) != Some(secret.public_key()) {
            return Err(ChainError::Key {
                party: me,
                path: key_path(dir, me, KeyKind::Secret),
                reason: "secret key does not match published public key".to_string(),
            });
        }

        tracing::debug!(party = %me, peers = verifying.len(), "loaded key store");
        Ok(Self { me, topology, signing, secret, verifying, agency_keys, telecom_keys })
    }

    /// The owner of this store.
    pub fn me(&self) -> PartyId {
        self.me
    }

    /// Party counts the store was loaded for.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Every agency id in ascending order.
    pub fn agency_ids(&self) -> impl Iterator<Item = AgencyId> + '_ {
        self.agency_keys.keys().copied()
    }

    /// Sign `payload` with the owner's signing key.
    pub fn sign(&self, payload: &[u8]) -> SignatureBytes {
        SignatureBytes(sign(payload, &self.signing).to_bytes().to_vec())
    }

    /// Verify `signer`'s signature over `payload`. Unknown signers fail.
    pub fn verify(&self, signer: PartyId, payload: &[u8], signature: &SignatureBytes) -> bool {
        self.verifying.get(&signer).is_some_and(|key| verify(payload, &signature.0, key))
    }

    /// Seal `user` into a token only `telecom` can open.
    pub fn encrypt_for_telecom(
        &self,
        telecom: TelecomId,
        user: UserId,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<IdentityToken, ChainError> {
        let key = self
            .telecom_keys
            .get(&telecom)
            .ok_or_else(|| ChainError::protocol(format!("unknown {telecom}")))?;
        let sealed = SealedId::seal(user, key, rng)?;
        Ok(IdentityToken { owner: telecom, sealed: sealed.to_bytes().to_vec() })
    }

    /// Add `agency`'s layer to `value`.
    pub fn encrypt_layer_for_agency(
        &self,
        agency: AgencyId,
        value: LayeredCiphertext,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<LayeredCiphertext, ChainError> {
        let key = self
            .agency_keys
            .get(&agency)
            .ok_or_else(|| ChainError::protocol(format!("unknown {agency}")))?;
        Ok(value.layer_encrypt(agency.0, key, rng))
    }

    /// Encrypt `user` under every agency's layer, in ascending agency order.
    pub fn encrypt_for_agencies(
        &self,
        user: UserId,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<AgencyCiphertext, ChainError> {
        let mut value = LayeredCiphertext::new(user)?;
        for (agency, key) in &self.agency_keys {
            value = value.layer_encrypt(agency.0, key, rng);
        }
        Ok(AgencyCiphertext(value.to_bytes()))
    }

    /// Open a token addressed to this telecom.
    pub fn decrypt_own(&self, token: &IdentityToken) -> Result<UserId, ChainError> {
        if PartyId::Telecom(token.owner) != self.me {
            let reason = format!("token for {} sent to {}", token.owner, self.me);
            return Err(ChainError::protocol(reason));
        }
        Ok(SealedId::from_bytes(&token.sealed)?.open(&self.secret)?)
    }

    /// Strip this agency's layer from `value`.
    pub fn decrypt_own_layer(
        &self,
        value: LayeredCiphertext,
    ) -> Result<LayeredCiphertext, ChainError> {
        let PartyId::Agency(agency) = self.me else {
            return Err(ChainError::protocol(format!("{} holds no agency layer", self.me)));
        };
        Ok(value.layer_decrypt(agency.0, &self.secret)?)
    }
}

fn public_of(
    agencies: &BTreeMap<AgencyId, PublicKey>,
    telecoms: &BTreeMap<TelecomId, PublicKey>,
    party: PartyId,
) -> Option<PublicKey> {
    match party {
        PartyId::Agency(id) => agencies.get(&id).copied(),
        PartyId::Telecom(id) => telecoms.get(&id).copied(),
    }
}

fn read_key<T>(
    dir: &Path,
    party: PartyId,
    kind: KeyKind,
    parse: impl FnOnce(&[u8]) -> Result<T, chaining_crypto::CryptoError>,
) -> Result<T, ChainError> {
    let path = key_path(dir, party, kind);
    let key_error = |reason: String| ChainError::Key { party, path: path.clone(), reason };

    let text = fs::read_to_string(&path).map_err(|e| key_error(e.to_string()))?;
    let bytes = hex::decode(text.trim()).map_err(|e| key_error(e.to_string()))?;
    parse(&bytes).map_err(|e| key_error(e.to_string()))
}
