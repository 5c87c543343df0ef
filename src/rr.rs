//! Component A: the RRSet store.
//!
//! A keyed map from record type to ordered RRset, with atomic
//! set/add/delete/replace operations. One store lives inside every
//! [`crate::zonetree::ZoneNode`], scoped to that node's owner name.

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;
use domain::base::iana::Class;
use domain::base::rdata::RecordData;
use domain::base::{Name, Rtype, Ttl};
use domain::rdata::ZoneRecordData;

use crate::error::EngineError;

/// An owned, non-compressible domain name, matching the convention used
/// throughout the engine (and the teacher codebase's `StoredName`).
pub type StoredName = Name<Bytes>;

/// Owned record data for any record type the engine has to carry.
pub type StoredRecordData = ZoneRecordData<Bytes, StoredName>;

/// Per-record side channel: everything about an RR that isn't part of its
/// (owner, class, ttl, rdata) identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordInfo {
    /// The record is present but should not be served or signed.
    pub disabled: bool,

    /// A free-text operator comment.
    pub comment: Option<String>,

    /// Set once the record becomes a history row (see [`crate::history`]).
    pub deleted_at: Option<jiff::Timestamp>,

    /// Glue records accompanying an NS record, carried along so IXFR
    /// history rows can include them (spec §4.F step 5).
    pub glue: Vec<OwnedRr>,
}

/// A single resource record, owned and addressable independent of the zone
/// tree node it lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedRr {
    pub owner: StoredName,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: StoredRecordData,
    pub info: RecordInfo,
}

impl OwnedRr {
    pub fn new(owner: StoredName, class: Class, ttl: Ttl, rdata: StoredRecordData) -> Self {
        Self {
            owner,
            class,
            ttl,
            rdata,
            info: RecordInfo::default(),
        }
    }

    pub fn rtype(&self) -> Rtype {
        self.rdata.rtype()
    }

    /// Equality per spec §3: (name, type, class, rdata). [`PartialEq`] on
    /// [`OwnedRr`] additionally compares TTL and record info, so mutation
    /// code that needs the spec's narrower notion of "the same record" uses
    /// this instead.
    pub fn is_same_record(&self, other: &Self) -> bool {
        self.owner == other.owner && self.class == other.class && self.rdata == other.rdata
    }
}

/// The ordered sequence of RRs sharing (owner, type, class).
#[derive(Clone, Debug, Default)]
pub struct RRSet {
    records: Vec<OwnedRr>,
}

impl RRSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<OwnedRr>) -> Result<Self, EngineError> {
        let mut set = Self::new();
        for rr in records {
            set.push_checked(rr).map_err(|reason| EngineError::InvalidRRSet {
                zone: set
                    .owner()
                    .cloned()
                    .unwrap_or_else(|| Name::root_bytes().try_into().unwrap()),
                reason,
            })?;
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[OwnedRr] {
        &self.records
    }

    pub fn owner(&self) -> Option<&StoredName> {
        self.records.first().map(|r| &r.owner)
    }

    pub fn rtype(&self) -> Option<Rtype> {
        self.records.first().map(OwnedRr::rtype)
    }

    pub fn class(&self) -> Option<Class> {
        self.records.first().map(|r| r.class)
    }

    pub fn ttl(&self) -> Option<Ttl> {
        self.records.first().map(|r| r.ttl)
    }

    /// Insert `rr`, enforcing the invariants in spec §3: shared TTL/class
    /// across the set, and no duplicate RDATA.
    fn push_checked(&mut self, rr: OwnedRr) -> Result<(), String> {
        if let Some(first) = self.records.first() {
            if first.owner != rr.owner {
                return Err(format!(
                    "RRset owner mismatch: '{}' vs '{}'",
                    first.owner, rr.owner
                ));
            }
            if first.class != rr.class {
                return Err("RRset members must share one class".into());
            }
            if first.ttl != rr.ttl {
                return Err("RRset members must share one TTL".into());
            }
            if first.rtype() != rr.rtype() {
                return Err("RRset members must share one type".into());
            }
        }
        if self.records.iter().any(|existing| existing.rdata == rr.rdata) {
            return Err("duplicate RDATA in RRset".into());
        }
        self.records.push(rr);
        Ok(())
    }
}

/// A per-owner-name keyed map from record type to [`RRSet`], atomic with
/// respect to readers (spec §4.A).
#[derive(Default)]
pub struct RRSetStore {
    sets: RwLock<BTreeMap<Rtype, RRSet>>,
}

impl RRSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `get(type)`. Returns an empty RRset if none is stored.
    pub fn get(&self, rtype: Rtype) -> RRSet {
        self.sets
            .read()
            .unwrap()
            .get(&rtype)
            .cloned()
            .unwrap_or_default()
    }

    /// `set(type, records) -> deleted-records`.
    pub fn set(&self, owner: &StoredName, records: Vec<OwnedRr>) -> Result<RRSet, EngineError> {
        let rtype = records
            .first()
            .map(OwnedRr::rtype)
            .unwrap_or(Rtype::from_int(0));
        let new_set = RRSet::from_records(records).map_err(|e| match e {
            EngineError::InvalidRRSet { reason, .. } => EngineError::InvalidRRSet {
                zone: owner.clone(),
                reason,
            },
            other => other,
        })?;
        if let Some(new_owner) = new_set.owner() {
            if new_owner != owner {
                return Err(EngineError::InvalidRRSet {
                    zone: owner.clone(),
                    reason: "supplied records do not share the requested owner".into(),
                });
            }
        }
        let mut sets = self.sets.write().unwrap();
        let old = sets.insert(rtype, new_set).unwrap_or_default();
        Ok(old)
    }

    /// `add(record) -> appended`. Fails if it would violate TTL/class
    /// uniformity or duplicate existing RDATA.
    pub fn add(&self, rr: OwnedRr) -> Result<OwnedRr, EngineError> {
        let rtype = rr.rtype();
        let mut sets = self.sets.write().unwrap();
        let set = sets.entry(rtype).or_default();
        set.push_checked(rr.clone()).map_err(|reason| EngineError::InvalidRRSet {
            zone: rr.owner.clone(),
            reason,
        })?;
        Ok(rr)
    }

    /// `delete(type) -> deleted-records`.
    pub fn delete(&self, rtype: Rtype) -> RRSet {
        self.sets.write().unwrap().remove(&rtype).unwrap_or_default()
    }

    /// `delete(type, rdata) -> deleted-record-or-none`.
    pub fn delete_rdata(&self, rtype: Rtype, rdata: &StoredRecordData) -> Option<OwnedRr> {
        let mut sets = self.sets.write().unwrap();
        let set = sets.get_mut(&rtype)?;
        let idx = set.records.iter().position(|r| &r.rdata == rdata)?;
        let removed = set.records.remove(idx);
        if set.records.is_empty() {
            sets.remove(&rtype);
        }
        Some(removed)
    }

    /// `add-or-update-rrsig(records) -> deleted-records`. RRSIGs are keyed
    /// by (type-covered, key-tag) rather than raw RDATA equality, so a
    /// refreshed signature from the same key replaces the old one instead
    /// of being rejected as a duplicate.
    pub fn add_or_update_rrsig(&self, records: Vec<OwnedRr>) -> Vec<OwnedRr> {
        let mut sets = self.sets.write().unwrap();
        let set = sets.entry(Rtype::RRSIG).or_default();
        let mut deleted = Vec::new();
        for rr in records {
            let ZoneRecordData::Rrsig(new_sig) = &rr.rdata else {
                continue;
            };
            if let Some(idx) = set.records.iter().position(|existing| {
                matches!(&existing.rdata, ZoneRecordData::Rrsig(old_sig)
                    if old_sig.type_covered() == new_sig.type_covered()
                        && old_sig.key_tag() == new_sig.key_tag())
            }) {
                deleted.push(set.records.remove(idx));
            }
            set.records.push(rr);
        }
        deleted
    }

    /// Replaces the glue attached to the NS record matching `ns_rdata`,
    /// returning (old glue, new glue) so the caller can fold both into its
    /// IXFR history rows (spec §4.F step 5: "deleted set (with glue for
    /// NS)"/"added set (with glue for NS)").
    pub fn set_ns_glue(
        &self,
        ns_rdata: &StoredRecordData,
        glue: Vec<OwnedRr>,
    ) -> Result<(Vec<OwnedRr>, Vec<OwnedRr>), EngineError> {
        let mut sets = self.sets.write().unwrap();
        let set = sets.get_mut(&Rtype::NS).ok_or_else(|| EngineError::InvalidRRSet {
            zone: Name::root_bytes().try_into().unwrap(),
            reason: "no NS record to attach glue to".into(),
        })?;
        let record = set
            .records
            .iter_mut()
            .find(|r| &r.rdata == ns_rdata)
            .ok_or_else(|| EngineError::InvalidRRSet {
                zone: set.owner().cloned().unwrap_or_else(|| Name::root_bytes().try_into().unwrap()),
                reason: "no matching NS record to attach glue to".into(),
            })?;
        let old = std::mem::replace(&mut record.info.glue, glue.clone());
        Ok((old, glue))
    }

    /// Removes any RRSIG whose type-covered is `rtype`, used when that type's
    /// RRset has just been emptied but the owner still carries other types
    /// (so the rest of the RRSIG set is left alone).
    pub fn remove_rrsigs_covering(&self, rtype: Rtype) -> Vec<OwnedRr> {
        let mut sets = self.sets.write().unwrap();
        let Some(set) = sets.get_mut(&Rtype::RRSIG) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        set.records.retain(|rr| match &rr.rdata {
            ZoneRecordData::Rrsig(sig) if sig.type_covered() == rtype => {
                removed.push(rr.clone());
                false
            }
            _ => true,
        });
        if set.records.is_empty() {
            sets.remove(&Rtype::RRSIG);
        }
        removed
    }

    /// Every record type currently present, including NSEC/NSEC3/RRSIG —
    /// the raw material for the "types present" bitmap (spec §4.D).
    pub fn types_present(&self) -> Vec<Rtype> {
        self.sets.read().unwrap().keys().copied().collect()
    }

    /// True if only NSEC/NSEC3 and their RRSIGs remain — i.e. the node
    /// carries no real content of its own (spec §4.D incremental relink).
    pub fn is_denial_only(&self) -> bool {
        self.sets
            .read()
            .unwrap()
            .keys()
            .all(|t| matches!(*t, Rtype::NSEC | Rtype::NSEC3 | Rtype::RRSIG))
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use domain::rdata::A;

    use super::*;

    fn name(s: &str) -> StoredName {
        StoredName::from_str(s).unwrap()
    }

    fn a_rr(owner: &str, addr: [u8; 4]) -> OwnedRr {
        OwnedRr::new(
            name(owner),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(addr[0], addr[1], addr[2], addr[3])),
        )
    }

    #[test]
    fn set_returns_prior_rrset() {
        let store = RRSetStore::new();
        let owner = name("www.example.");
        store.add(a_rr("www.example.", [192, 0, 2, 1])).unwrap();

        let old = store
            .set(&owner, vec![a_rr("www.example.", [192, 0, 2, 2])])
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(store.get(Rtype::A).len(), 1);
    }

    #[test]
    fn add_rejects_ttl_mismatch() {
        let store = RRSetStore::new();
        store.add(a_rr("www.example.", [192, 0, 2, 1])).unwrap();
        let mut mismatched = a_rr("www.example.", [192, 0, 2, 2]);
        mismatched.ttl = Ttl::from_secs(60);
        assert!(store.add(mismatched).is_err());
    }

    #[test]
    fn add_rejects_duplicate_rdata() {
        let store = RRSetStore::new();
        store.add(a_rr("www.example.", [192, 0, 2, 1])).unwrap();
        assert!(store.add(a_rr("www.example.", [192, 0, 2, 1])).is_err());
    }

    #[test]
    fn delete_rdata_removes_only_matching_member() {
        let store = RRSetStore::new();
        store.add(a_rr("www.example.", [192, 0, 2, 1])).unwrap();
        store.add(a_rr("www.example.", [192, 0, 2, 2])).unwrap();

        let ZoneRecordData::A(addr) = a_rr("www.example.", [192, 0, 2, 1]).rdata else {
            unreachable!()
        };
        let removed = store.delete_rdata(Rtype::A, &ZoneRecordData::A(addr));
        assert!(removed.is_some());
        assert_eq!(store.get(Rtype::A).len(), 1);
    }
}
