//! Component E (part 1): the key registry and the private key record.
//!
//! The lifecycle state machine itself lives in [`lifecycle`]; this module
//! owns the data it operates on.

pub mod lifecycle;

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;
use domain::crypto::sign::{GenerateParams, KeyPair};
use domain::dnssec::sign::keys::SigningKey;
use domain::rdata::Dnskey;
use jiff::Timestamp;

use crate::error::EngineError;
use crate::rr::StoredName;

/// KSK or ZSK. Spec §3: "key-type ∈ {KSK, ZSK}".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    Ksk,
    Zsk,
}

/// A private key's position in the spec §4.E state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    Generated,
    Published,
    Ready,
    Active,
    Retired,
    Revoked,
    Removed,
}

/// Generation parameters accepted by `sign-zone` and `rollover`. This is a
/// thin, serializable wrapper over `domain`'s own
/// [`domain::crypto::sign::GenerateParams`] — kept distinct so callers of
/// this crate never need the `unstable-crypto-sign` feature's types in
/// their own signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    RsaSha256 { bits: u16 },
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
    Ed448,
    /// Accepted for legacy continuity only (spec §9 open question): never
    /// offered as a default and never produced by `rollover`.
    RsaMd5 { bits: u16 },
}

impl KeyAlgorithm {
    fn into_generate_params(self) -> Result<GenerateParams, String> {
        Ok(match self {
            Self::RsaSha256 { bits } => GenerateParams::RsaSha256 { bits: bits.into() },
            Self::RsaMd5 { bits } => {
                return Err(format!(
                    "RSAMD5 ({bits}-bit) is accepted for legacy verification only and cannot be generated"
                ))
            }
            Self::EcdsaP256Sha256 => GenerateParams::EcdsaP256Sha256,
            Self::EcdsaP384Sha384 => GenerateParams::EcdsaP384Sha384,
            Self::Ed25519 => GenerateParams::Ed25519,
            Self::Ed448 => GenerateParams::Ed448,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RsaSha256 { .. } => "RSASHA256",
            Self::RsaMd5 { .. } => "RSAMD5",
            Self::EcdsaP256Sha256 => "ECDSAP256SHA256",
            Self::EcdsaP384Sha384 => "ECDSAP384SHA384",
            Self::Ed25519 => "ED25519",
            Self::Ed448 => "ED448",
        }
    }
}

/// One entry in a zone's key registry (spec §3, "Private Key Record").
///
/// The signing capability itself — sign/dnskey-rdata/key-tag — is supplied
/// by `domain`'s own [`SigningKey`]/[`KeyPair`], which are already
/// polymorphic over algorithm (spec §9's "polymorphism over key
/// algorithms" note is satisfied by reusing that machinery rather than
/// re-inventing it).
pub struct PrivateKeyRecord {
    pub kind: KeyKind,
    pub state: KeyState,
    pub state_changed_at: Timestamp,
    pub is_retiring: bool,
    pub rollover_days: u32,
    pub signing_key: SigningKey<Bytes, KeyPair>,
}

impl PrivateKeyRecord {
    pub fn key_tag(&self) -> u16 {
        self.signing_key.public_key().key_tag()
    }

    pub fn algorithm(&self) -> domain::base::iana::SecurityAlgorithm {
        self.signing_key.public_key().algorithm()
    }

    pub fn dnskey_rdata(&self) -> Dnskey<Bytes> {
        self.signing_key.public_key().dnskey().convert()
    }

    pub fn revoke_bit_set(&self) -> bool {
        self.dnskey_rdata().is_revoked()
    }

    /// Transitions `self` into `next`, updating the state-change timestamp.
    pub(crate) fn transition(&mut self, next: KeyState, now: Timestamp) {
        self.state = next;
        self.state_changed_at = now;
    }
}

/// Generates a fresh private key of the given kind and algorithm, owned by
/// `apex`. Used both by `sign-zone` (initial KSK/ZSK pair) and by
/// `rollover` (spec §4.E).
pub fn generate_key(
    apex: &StoredName,
    kind: KeyKind,
    algorithm: KeyAlgorithm,
    now: Timestamp,
) -> Result<PrivateKeyRecord, EngineError> {
    let params = algorithm.into_generate_params().map_err(|reason| {
        EngineError::UnsupportedAlgorithm {
            zone: apex.clone(),
            algorithm: reason,
        }
    })?;
    let flags = match kind {
        KeyKind::Ksk => 257,
        KeyKind::Zsk => 256,
    };
    let key_pair: KeyPair = domain::crypto::sign::generate(params).map_err(|err| {
        EngineError::UnsupportedAlgorithm {
            zone: apex.clone(),
            algorithm: format!("{}: key generation failed: {err}", algorithm.name()),
        }
    })?;
    let signing_key = SigningKey::new(apex.clone(), flags, key_pair);
    Ok(PrivateKeyRecord {
        kind,
        state: KeyState::Generated,
        state_changed_at: now,
        is_retiring: false,
        rollover_days: 90,
        signing_key,
    })
}

/// A zone's set of private keys, keyed by key tag (spec §5: "key registry
/// lock — guards the key map; held briefly; action dispatch happens after
/// release").
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<BTreeMap<u16, PrivateKeyRecord>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key`, retrying with a freshly generated key tag (by
    /// regenerating) up to 5 times on collision — spec §4.E, `rollover`'s
    /// "retry on tag collision up to 5 attempts".
    pub fn insert_unique(
        &self,
        zone: &StoredName,
        key: PrivateKeyRecord,
    ) -> Result<u16, EngineError> {
        let mut keys = self.keys.write().unwrap();
        let tag = key.key_tag();
        if keys.contains_key(&tag) {
            return Err(EngineError::DuplicateKey {
                zone: zone.clone(),
                key_tag: tag,
            });
        }
        keys.insert(tag, key);
        Ok(tag)
    }

    pub fn remove(&self, key_tag: u16) -> Option<PrivateKeyRecord> {
        self.keys.write().unwrap().remove(&key_tag)
    }

    /// Empties the registry. Used by `unsign-zone` and by `sign-zone`'s
    /// error-recovery path (spec §7: "Crypto signing failures inside a
    /// whole-zone sign roll back DNSSEC status to Unsigned and clear the
    /// key registry").
    pub fn clear(&self) {
        self.keys.write().unwrap().clear();
    }

    pub fn contains_tag(&self, key_tag: u16) -> bool {
        self.keys.read().unwrap().contains_key(&key_tag)
    }

    pub fn with_key<R>(&self, key_tag: u16, f: impl FnOnce(&PrivateKeyRecord) -> R) -> Option<R> {
        self.keys.read().unwrap().get(&key_tag).map(f)
    }

    pub fn with_key_mut<R>(
        &self,
        key_tag: u16,
        f: impl FnOnce(&mut PrivateKeyRecord) -> R,
    ) -> Option<R> {
        self.keys.write().unwrap().get_mut(&key_tag).map(f)
    }

    /// A snapshot of (tag, kind, state, algorithm) for every key, used by
    /// the lifecycle engine to plan actions under the lock and apply them
    /// after release (spec §4.E timer cadence).
    pub fn snapshot(&self) -> Vec<(u16, KeyKind, KeyState, bool)> {
        self.keys
            .read()
            .unwrap()
            .values()
            .map(|k| (k.key_tag(), k.kind, k.state, k.is_retiring))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn tags_in_state(&self, kind: KeyKind, state: KeyState) -> Vec<u16> {
        self.keys
            .read()
            .unwrap()
            .values()
            .filter(|k| k.kind == kind && k.state == state)
            .map(PrivateKeyRecord::key_tag)
            .collect()
    }

    /// True if another key of the same kind/algorithm is Active and not
    /// retiring — the core of the spec §4.E retire-safety check.
    pub fn has_other_active(&self, exclude_tag: u16, kind: KeyKind, algorithm: domain::base::iana::SecurityAlgorithm) -> bool {
        self.keys.read().unwrap().values().any(|k| {
            k.key_tag() != exclude_tag
                && k.kind == kind
                && k.state == KeyState::Active
                && !k.is_retiring
                && k.algorithm() == algorithm
        })
    }

    /// True if another key of the same kind/algorithm is Ready — used for
    /// the KSK "both Ready" retire-safety exception (spec §9 open question,
    /// resolved in `DESIGN.md`).
    pub fn has_other_ready(&self, exclude_tag: u16, kind: KeyKind, algorithm: domain::base::iana::SecurityAlgorithm) -> bool {
        self.keys.read().unwrap().values().any(|k| {
            k.key_tag() != exclude_tag
                && k.kind == kind
                && k.state == KeyState::Ready
                && k.algorithm() == algorithm
        })
    }
}
