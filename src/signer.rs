//! Component C: the signer.
//!
//! Builds one RRSIG per eligible key for a single RRset, following RFC
//! 4034's signed-data construction directly rather than delegating to
//! `domain::dnssec::sign`'s whole-zone signer (see `SPEC_FULL.md`'s
//! documented divergence — this engine signs one RRset incrementally at a
//! time, which the whole-zone API isn't shaped for).
//!
//! Grounded on the RRSIG-construction loop in
//! `examples/other_examples/...domain-sign-src-sign.rs.rs`'s `SortedRecords::sign`:
//! build the RRSIG rdata with an empty signature, `compose_canonical` it
//! plus every canonically-sorted member of the RRset into one buffer, then
//! hand that buffer to the key.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use domain::base::cmp::CanonicalOrd;
use domain::base::iana::Rtype;
use domain::base::name::ToLabelIter;
use domain::base::rdata::ComposeRecordData;
use domain::base::wire::Compose;
use domain::base::{Record, Ttl};
use domain::crypto::sign::KeyPair;
use domain::crypto::sign::SignRaw;
use domain::dnssec::sign::keys::SigningKey;
use domain::rdata::dnssec::Timestamp;
use domain::rdata::{Rrsig, ZoneRecordData};

use crate::error::EngineError;
use crate::keys::{KeyKind, KeyRegistry, KeyState};
use crate::rr::{OwnedRr, RRSet, StoredName};

/// Record types that must never be signed directly, or that signing
/// refuses inside an already-signed zone (spec §4.C).
fn reject_unsignable(zone: &StoredName, rtype: Rtype) -> Result<(), EngineError> {
    if rtype == Rtype::RRSIG {
        return Err(EngineError::InvalidOperation {
            zone: zone.clone(),
            reason: "RRSIG records cannot themselves be signed".into(),
        });
    }
    if matches!(rtype.to_string().as_str(), "ANAME" | "APP") {
        return Err(EngineError::UnsupportedInSignedZone {
            zone: zone.clone(),
            rtype,
        });
    }
    Ok(())
}

/// The window within which a freshly minted RRSIG is valid (spec §4.C:
/// inception = now − 60 min, expiry = now + (SOA.expire + 3 days)).
#[derive(Clone, Copy, Debug)]
pub struct ValidityWindow {
    pub inception: Timestamp,
    pub expiration: Timestamp,
}

impl ValidityWindow {
    pub fn compute(now_unix: u32, inception_offset: Duration, soa_expire: u32, validity_margin: Duration) -> Self {
        let inception = now_unix.wrapping_sub(inception_offset.as_secs() as u32);
        let validity = soa_expire.wrapping_add(validity_margin.as_secs() as u32);
        let expiration = now_unix.wrapping_add(validity);
        Self {
            inception: Timestamp::from(inception),
            expiration: Timestamp::from(expiration),
        }
    }
}

/// `labels` per RFC 4034 §3.1.3: owner-name label count excluding the
/// trailing root label and any leading wildcard label.
pub fn compute_labels(owner: &StoredName) -> u8 {
    let mut count = owner.label_count();
    if count > 0 {
        // Exclude the root label, which `label_count` includes.
        count -= 1;
    }
    if let Some(first) = owner.iter_labels().next() {
        if first.as_slice() == b"*" {
            count = count.saturating_sub(1);
        }
    }
    count as u8
}

/// Which keys are eligible to sign an RRset of the given type (spec §4.C).
fn eligible_keys(registry: &KeyRegistry, rtype: Rtype) -> Vec<u16> {
    if rtype == Rtype::DNSKEY {
        [
            KeyState::Generated,
            KeyState::Published,
            KeyState::Ready,
            KeyState::Active,
            KeyState::Revoked,
        ]
        .into_iter()
        .flat_map(|state| registry.tags_in_state(KeyKind::Ksk, state))
        .collect()
    } else {
        [KeyState::Ready, KeyState::Active]
            .into_iter()
            .flat_map(|state| registry.tags_in_state(KeyKind::Zsk, state))
            .collect()
    }
}

/// Encodes the RRSIG rdata (with an empty signature) plus every
/// canonically-sorted RR in `rrset`, ready to hand to `SignRaw::sign_raw`.
fn rdata_to_sign_bytes(rrset: &RRSet, rrsig: &Rrsig<Bytes, StoredName>) -> Bytes {
    let mut buf = BytesMut::new();
    rrsig.compose_canonical_rdata(&mut buf);

    let mut members: Vec<&OwnedRr> = rrset.records().iter().filter(|r| !r.info.disabled).collect();
    members.sort_by(|a, b| a.rdata.canonical_cmp(&b.rdata));

    for rr in members {
        let record = Record::new(rr.owner.clone(), rr.class, rr.ttl, rr.rdata.clone());
        record.compose_canonical(&mut buf);
    }
    buf.freeze()
}

/// Produces one RRSIG per eligible key for `rrset`, owned by `owner` at or
/// under `apex`. `is_delegation_ns` should be true for an NS RRset whose
/// owner is strictly below the apex (those are never signed).
pub fn sign_rrset(
    apex: &StoredName,
    owner: &StoredName,
    rrset: &RRSet,
    registry: &KeyRegistry,
    window: ValidityWindow,
    is_delegation_ns: bool,
) -> Result<Vec<OwnedRr>, EngineError> {
    let Some(rtype) = rrset.rtype() else {
        return Ok(Vec::new());
    };
    if is_delegation_ns {
        return Ok(Vec::new());
    }
    reject_unsignable(apex, rtype)?;

    let tags = eligible_keys(registry, rtype);
    if tags.is_empty() {
        return Err(EngineError::NoSigningKey {
            zone: apex.clone(),
            rtype,
        });
    }

    let class = rrset.class().unwrap_or(domain::base::iana::Class::IN);
    let ttl = rrset.ttl().unwrap_or(Ttl::from_secs(0));
    let labels = compute_labels(owner);

    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let signed = registry
            .with_key(tag, |key| -> Result<OwnedRr, EngineError> {
                let rrsig_unsigned = Rrsig::new(
                    rtype,
                    key.algorithm(),
                    labels,
                    ttl.as_secs(),
                    window.expiration,
                    window.inception,
                    tag,
                    apex.clone(),
                    Bytes::new(),
                )
                .map_err(|err| EngineError::InvalidRRSet {
                    zone: apex.clone(),
                    reason: format!("could not build RRSIG rdata: {err}"),
                })?;

                let to_sign = rdata_to_sign_bytes(rrset, &rrsig_unsigned);
                let signature = sign_with(&key.signing_key, &to_sign)?;

                let rrsig = Rrsig::new(
                    rtype,
                    key.algorithm(),
                    labels,
                    ttl.as_secs(),
                    window.expiration,
                    window.inception,
                    tag,
                    apex.clone(),
                    signature,
                )
                .map_err(|err| EngineError::InvalidRRSet {
                    zone: apex.clone(),
                    reason: format!("could not build signed RRSIG rdata: {err}"),
                })?;

                Ok(OwnedRr::new(
                    owner.clone(),
                    class,
                    ttl,
                    ZoneRecordData::Rrsig(rrsig),
                ))
            })
            .ok_or(EngineError::KeyNotFound {
                zone: apex.clone(),
                key_tag: tag,
            })??;
        out.push(signed);
    }
    Ok(out)
}

fn sign_with(key: &SigningKey<Bytes, KeyPair>, data: &[u8]) -> Result<Bytes, EngineError> {
    key.key()
        .sign_raw(data)
        .map(|sig| Bytes::copy_from_slice(sig.as_ref()))
        .map_err(|err| EngineError::InvalidRRSet {
            zone: key.owner().clone(),
            reason: format!("signing failed: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use domain::rdata::A;

    use super::*;
    use crate::keys::{generate_key, KeyAlgorithm};

    fn apex() -> StoredName {
        StoredName::from_str("example.").unwrap()
    }

    #[test]
    fn labels_excludes_root_and_wildcard() {
        assert_eq!(compute_labels(&StoredName::from_str("example.").unwrap()), 0);
        assert_eq!(
            compute_labels(&StoredName::from_str("www.example.").unwrap()),
            2
        );
        assert_eq!(
            compute_labels(&StoredName::from_str("*.example.").unwrap()),
            1
        );
    }

    #[test]
    fn no_eligible_key_fails_with_no_signing_key() {
        let registry = KeyRegistry::new();
        let mut rrset = RRSet::new();
        let rr = OwnedRr::new(
            apex(),
            domain::base::iana::Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 1)),
        );
        rrset = RRSet::from_records(vec![rr]).unwrap();

        let window = ValidityWindow::compute(1_700_000_000, Duration::from_secs(3600), 604_800, Duration::from_secs(3 * 86_400));
        let err = sign_rrset(&apex(), &apex(), &rrset, &registry, window, false).unwrap_err();
        assert!(matches!(err, EngineError::NoSigningKey { .. }));
    }

    #[test]
    fn zsk_signs_ordinary_rrset() {
        let registry = KeyRegistry::new();
        let now = jiff::Timestamp::from_second(1_700_000_000).unwrap();
        let zsk = generate_key(&apex(), KeyKind::Zsk, KeyAlgorithm::Ed25519, now).unwrap();
        let tag = registry.insert_unique(&apex(), zsk).unwrap();
        registry.with_key_mut(tag, |k| k.state = KeyState::Active);

        let rr = OwnedRr::new(
            apex(),
            domain::base::iana::Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 1)),
        );
        let rrset = RRSet::from_records(vec![rr]).unwrap();

        let window = ValidityWindow::compute(1_700_000_000, Duration::from_secs(3600), 604_800, Duration::from_secs(3 * 86_400));
        let sigs = sign_rrset(&apex(), &apex(), &rrset, &registry, window, false).unwrap();
        assert_eq!(sigs.len(), 1);
        assert!(matches!(sigs[0].rdata, ZoneRecordData::Rrsig(_)));
    }
}
