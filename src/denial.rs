//! Component D: the denial builder.
//!
//! Builds and maintains NSEC or NSEC3 authenticated denial-of-existence
//! chains over a [`crate::zonetree::ZoneTree`], per spec §4.D. Per
//! `SPEC_FULL.md`'s documented divergence, this computes denial records
//! directly against the zone tree — rather than through
//! `domain::dnssec::sign::denial`'s whole-zone builder — so that
//! `relink_incremental` can touch only the owners actually affected by one
//! mutation instead of recomputing the whole chain.

use std::sync::Arc;

use bytes::Bytes;
use domain::base::cmp::CanonicalOrd;
use domain::base::iana::Rtype;
use domain::base::name::ToLabelIter;
use domain::base::iana::Nsec3HashAlgorithm;
use domain::rdata::nsec3::{Nsec3Salt, OwnerHash};
use domain::rdata::{Nsec, Nsec3, Nsec3param, ZoneRecordData};
use ring::digest;

use crate::committer::PendingChange;
use crate::error::EngineError;
use crate::rr::{OwnedRr, StoredName};
use crate::signer::{sign_rrset, ValidityWindow};
use crate::keys::KeyRegistry;
use crate::zonetree::{ZoneNode, ZoneTree};

/// The base32hex (RFC 4648 §7) alphabet, used lowercase per spec §6 ("owner
/// = base32hex-lower(hash)").
const BASE32HEX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

fn base32hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buf = 0u32;
    let mut bits = 0u32;
    for &b in bytes {
        buf = (buf << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = (buf >> bits) & 0x1f;
            out.push(BASE32HEX_ALPHABET[idx as usize] as char);
        }
    }
    if bits > 0 {
        let idx = (buf << (5 - bits)) & 0x1f;
        out.push(BASE32HEX_ALPHABET[idx as usize] as char);
    }
    out
}

/// RFC 5155 §5: `IH(salt, x, 0) = H(x || salt)`, `IH(salt, x, k) = H(IH(salt, x, k-1) || salt)`.
fn nsec3_hash(owner_wire: &[u8], salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut ih = {
        let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
        ctx.update(owner_wire);
        ctx.update(salt);
        ctx.finish().as_ref().to_vec()
    };
    for _ in 0..iterations {
        let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
        ctx.update(&ih);
        ctx.update(salt);
        ih = ctx.finish().as_ref().to_vec();
    }
    ih
}

/// Computes the canonical wire form of `name` (lowercased labels, no
/// compression) for hashing, and returns both the raw digest (the actual
/// rdata content of an owner/next-hashed-owner field, RFC 5155 §3/§4.1.3)
/// and the encoded name `<base32hex-lower(digest)>.<apex>` used as the
/// record's owner and for canonical-order sorting.
fn hashed_owner_name(apex: &StoredName, name: &StoredName, salt: &[u8], iterations: u16) -> (Vec<u8>, StoredName) {
    let mut wire = Vec::new();
    for label in name.iter_labels() {
        let lower: Vec<u8> = label.as_slice().iter().map(u8::to_ascii_lowercase).collect();
        wire.push(lower.len() as u8);
        wire.extend_from_slice(&lower);
    }
    wire.push(0);

    let digest = nsec3_hash(&wire, salt, iterations);
    let label = base32hex_lower(&digest);
    let encoded = format!("{label}.{apex}")
        .parse()
        .expect("hashed owner name is a valid DNS name");
    (digest, encoded)
}

/// NSEC/NSEC3 TTL per RFC 4034 §4/RFC 5155 §3: the apex SOA's minimum
/// field. Falls back to one hour if the apex has no SOA yet (should not
/// happen once a zone is signed).
fn denial_ttl(tree: &ZoneTree, apex: &StoredName) -> domain::base::Ttl {
    tree.find_exact(apex)
        .and_then(|node| {
            node.rrsets.get(Rtype::SOA).records().first().and_then(|rr| {
                match &rr.rdata {
                    ZoneRecordData::Soa(soa) => Some(soa.minimum()),
                    _ => None,
                }
            })
        })
        .unwrap_or(domain::base::Ttl::from_secs(3600))
}

fn bitmap_for(node: &ZoneNode, extra: &[Rtype]) -> domain::rdata::dnssec::RtypeBitmap<Bytes> {
    let mut builder = domain::rdata::dnssec::RtypeBitmap::<Bytes>::builder();
    for rtype in node.rrsets.types_present() {
        let _ = builder.add(rtype);
    }
    for rtype in extra {
        let _ = builder.add(*rtype);
    }
    builder.finalize()
}

/// `EnableNSEC(zones)`. Builds a ring over every currently-populated owner
/// (the apex included), signs each NSEC, and returns the new records to be
/// installed in the zone tree by the caller.
pub fn enable_nsec(
    tree: &ZoneTree,
    apex: &StoredName,
    registry: &KeyRegistry,
    window: ValidityWindow,
) -> Result<Vec<(StoredName, Vec<OwnedRr>)>, EngineError> {
    let nodes: Vec<Arc<ZoneNode>> = tree
        .all_in_canonical_order()
        .into_iter()
        .filter(|n| !n.rrsets.is_empty())
        .collect();

    let mut result = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let next = nodes.get(i + 1).map_or_else(|| apex.clone(), |n| n.name.clone());
        let bitmap = bitmap_for(node, &[Rtype::NSEC, Rtype::RRSIG]);
        let nsec = Nsec::new(next, bitmap);
        let ttl = denial_ttl(tree, apex);
        let rr = OwnedRr::new(node.name.clone(), domain::base::iana::Class::IN, ttl, ZoneRecordData::Nsec(nsec));
        let mut produced = vec![rr.clone()];
        let rrset = crate::rr::RRSet::from_records(vec![rr])?;
        produced.extend(sign_rrset(apex, &node.name, &rrset, registry, window, false)?);
        result.push((node.name.clone(), produced));
    }
    Ok(result)
}

/// `EnableNSEC3(zones, iterations, salt)`.
pub fn enable_nsec3(
    tree: &ZoneTree,
    apex: &StoredName,
    iterations: u16,
    salt: &[u8],
    registry: &KeyRegistry,
    window: ValidityWindow,
) -> Result<(Vec<(StoredName, Vec<OwnedRr>)>, Vec<StoredName>), EngineError> {
    validate_nsec3_params(apex, iterations, salt)?;

    let mut owners: Vec<StoredName> = tree
        .all_in_canonical_order()
        .into_iter()
        .filter(|n| !n.rrsets.is_empty())
        .map(|n| n.name.clone())
        .collect();

    // Materialize empty-non-terminals: every ancestor of a non-apex owner,
    // down to (but not including) the apex, that does not itself already
    // have an entry.
    let mut ents = Vec::new();
    for owner in &owners {
        let mut current = owner.clone();
        while current != *apex {
            let Some(parent) = current.parent() else { break };
            if parent == *apex {
                break;
            }
            if !owners.contains(&parent) && !ents.contains(&parent) {
                ents.push(parent.clone());
            }
            current = parent;
        }
    }
    owners.extend(ents.iter().cloned());

    // raw-digest, hashed-owner name -> union of type bitmaps to include.
    let mut entries: Vec<(Vec<u8>, StoredName, StoredName, Vec<Rtype>)> = Vec::new();
    for owner in &owners {
        let (digest, hashed) = hashed_owner_name(apex, owner, salt, iterations);
        let types: Vec<Rtype> = if ents.contains(owner) {
            Vec::new()
        } else {
            tree.find_exact(owner)
                .map(|n| n.rrsets.types_present())
                .unwrap_or_default()
        };
        entries.push((digest, hashed, owner.clone(), types));
    }
    entries.sort_by(|a, b| a.1.canonical_cmp(&b.1));
    entries.dedup_by(|a, b| {
        if a.1 == b.1 {
            b.3.extend(a.3.drain(..));
            true
        } else {
            false
        }
    });

    let mut result = Vec::new();
    let n = entries.len();
    for (i, (_digest, hashed, _owner, types)) in entries.iter().enumerate() {
        let next_digest = &entries[(i + 1) % n].0;
        let owner_hash = OwnerHash::from_octets(Bytes::copy_from_slice(next_digest))
            .map_err(|err| EngineError::InvalidParameter {
                zone: apex.clone(),
                parameter: "nsec3-next-hashed-owner".into(),
                reason: err.to_string(),
            })?;

        let mut builder = domain::rdata::dnssec::RtypeBitmap::<Bytes>::builder();
        for rtype in types {
            let _ = builder.add(*rtype);
        }
        let _ = builder.add(Rtype::RRSIG);
        let bitmap = builder.finalize();

        let nsec3_salt = Nsec3Salt::from_octets(Bytes::copy_from_slice(salt)).map_err(|err| {
            EngineError::InvalidParameter {
                zone: apex.clone(),
                parameter: "nsec3-salt".into(),
                reason: err.to_string(),
            }
        })?;

        let nsec3 = Nsec3::new(
            Nsec3HashAlgorithm::SHA1,
            0,
            iterations,
            nsec3_salt,
            owner_hash,
            bitmap,
        );
        let rr = OwnedRr::new(
            hashed.clone(),
            domain::base::iana::Class::IN,
            domain::base::Ttl::from_secs(3600),
            ZoneRecordData::Nsec3(nsec3),
        );
        let mut produced = vec![rr.clone()];
        let rrset = crate::rr::RRSet::from_records(vec![rr])?;
        produced.extend(sign_rrset(apex, hashed, &rrset, registry, window, false)?);
        result.push((hashed.clone(), produced));
    }

    let param_salt = Nsec3Salt::from_octets(Bytes::copy_from_slice(salt)).map_err(|err| {
        EngineError::InvalidParameter {
            zone: apex.clone(),
            parameter: "nsec3-salt".into(),
            reason: err.to_string(),
        }
    })?;
    let nsec3param = Nsec3param::new(Nsec3HashAlgorithm::SHA1, 0, iterations, param_salt);
    let param_rr = OwnedRr::new(
        apex.clone(),
        domain::base::iana::Class::IN,
        domain::base::Ttl::from_secs(3600),
        ZoneRecordData::Nsec3param(nsec3param),
    );
    let mut param_produced = vec![param_rr.clone()];
    let param_rrset = crate::rr::RRSet::from_records(vec![param_rr])?;
    param_produced.extend(sign_rrset(apex, apex, &param_rrset, registry, window, false)?);
    result.push((apex.clone(), param_produced));

    Ok((result, ents))
}

/// Validates NSEC3 iterations/salt-length bounds (spec §4.D: iterations ∈
/// [0, 50]; salt length ∈ [0, 32]).
pub fn validate_nsec3_params(apex: &StoredName, iterations: u16, salt: &[u8]) -> Result<(), EngineError> {
    if iterations > 50 {
        return Err(EngineError::InvalidParameter {
            zone: apex.clone(),
            parameter: "iterations".into(),
            reason: format!("{iterations} is outside the allowed range [0, 50]"),
        });
    }
    if salt.len() > 32 {
        return Err(EngineError::InvalidParameter {
            zone: apex.clone(),
            parameter: "salt-length".into(),
            reason: format!("{} is outside the allowed range [0, 32]", salt.len()),
        });
    }
    Ok(())
}

/// Removes every NSEC (and its RRSIG) in the tree, returning the deleted
/// records so the caller can fold them into a commit's deletion set.
pub fn disable_nsec(tree: &ZoneTree) -> Vec<OwnedRr> {
    let mut deleted = Vec::new();
    for node in tree.all_in_canonical_order() {
        deleted.extend(node.rrsets.delete(Rtype::NSEC).records().to_vec());
        deleted.extend(node.rrsets.delete(Rtype::RRSIG).records().into_iter().filter(|rr| {
            matches!(&rr.rdata, ZoneRecordData::Rrsig(sig) if sig.type_covered() == Rtype::NSEC)
        }).cloned());
    }
    deleted
}

/// Removes every NSEC3 (and its RRSIG), the NSEC3PARAM, and any subdomain
/// nodes that existed only to host an NSEC3 hashed-owner or ENT.
pub fn disable_nsec3(tree: &ZoneTree, apex: &StoredName, introduced_ents: &[StoredName]) -> Vec<OwnedRr> {
    let mut deleted = Vec::new();
    let mut to_remove = Vec::new();

    for node in tree.all_in_canonical_order() {
        let nsec3_deleted = node.rrsets.delete(Rtype::NSEC3);
        if !nsec3_deleted.is_empty() {
            deleted.extend(nsec3_deleted.records().to_vec());
            deleted.extend(
                node.rrsets
                    .delete(Rtype::RRSIG)
                    .records()
                    .iter()
                    .filter(|rr| {
                        matches!(&rr.rdata, ZoneRecordData::Rrsig(sig) if sig.type_covered() == Rtype::NSEC3)
                    })
                    .cloned(),
            );
            if node.rrsets.is_empty() && node.name != *apex {
                to_remove.push(node.name.clone());
            }
        }
    }

    let param_deleted = tree
        .find_exact(apex)
        .map(|apex_node| apex_node.rrsets.delete(Rtype::NSEC3PARAM))
        .unwrap_or_default();
    deleted.extend(param_deleted.records().to_vec());
    if let Some(apex_node) = tree.find_exact(apex) {
        deleted.extend(
            apex_node
                .rrsets
                .delete(Rtype::RRSIG)
                .records()
                .iter()
                .filter(|rr| {
                    matches!(&rr.rdata, ZoneRecordData::Rrsig(sig) if sig.type_covered() == Rtype::NSEC3PARAM)
                })
                .cloned(),
        );
    }

    for ent in introduced_ents {
        to_remove.push(ent.clone());
    }
    for name in to_remove {
        tree.remove(&name);
    }
    deleted
}

/// Recomputes `owner`'s denial record after an RRSet mutation, in an
/// NSEC-signed zone, and re-signs the NSEC records that had to change
/// (spec §4.D, "Incremental relink").
///
/// This recomputes the touched owner's own bitmap and, if the owner
/// becomes empty or newly appears, repairs exactly the one predecessor
/// link that needs to change — it does not attempt to garbage-collect
/// empty-non-terminals introduced by an NSEC3 chain (NSEC has none).
pub fn relink_nsec(
    tree: &ZoneTree,
    apex: &StoredName,
    owner: &StoredName,
    registry: &KeyRegistry,
    window: ValidityWindow,
) -> Result<PendingChange, EngineError> {
    let mut change = PendingChange::new();
    let Some(node) = tree.find_exact(owner) else {
        return Ok(change);
    };

    if node.rrsets.is_denial_only() {
        // The owner became empty: drop its NSEC and repoint the
        // predecessor at our former successor.
        let successor = tree
            .find_next(owner)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| apex.clone());
        let now = jiff::Timestamp::now();
        for mut rr in node.rrsets.delete(Rtype::NSEC).records().iter().cloned() {
            rr.info.deleted_at = Some(now);
            change.deleted.push(rr);
        }
        for mut rr in node.rrsets.delete(Rtype::RRSIG).records().iter().cloned() {
            rr.info.deleted_at = Some(now);
            change.deleted.push(rr);
        }
        tree.remove(owner);

        if let Some(prev) = tree.find_previous(owner) {
            change.added.extend(repoint_nsec(apex, &prev, &successor, registry, window)?);
        }
        return Ok(change);
    }

    let bitmap = bitmap_for(&node, &[Rtype::NSEC, Rtype::RRSIG]);
    let next = tree
        .find_next(owner)
        .map(|n| n.name.clone())
        .unwrap_or_else(|| apex.clone());
    let nsec = Nsec::new(next, bitmap);
    let ttl = denial_ttl(tree, apex);
    let rr = OwnedRr::new(owner.clone(), domain::base::iana::Class::IN, ttl, ZoneRecordData::Nsec(nsec));
    node.rrsets.set(owner, vec![rr.clone()])?;
    change.added.push(rr.clone());
    let rrset = crate::rr::RRSet::from_records(vec![rr])?;
    let sigs = sign_rrset(apex, owner, &rrset, registry, window, false)?;
    change.deleted.extend(node.rrsets.add_or_update_rrsig(sigs.clone()));
    change.added.extend(sigs);

    // If this owner is new, splice it in by repointing the previous NSEC.
    if let Some(prev) = tree.find_previous(owner) {
        if prev.name != *owner {
            change.added.extend(repoint_nsec(apex, &prev, owner, registry, window)?);
        }
    }

    Ok(change)
}

fn repoint_nsec(
    apex: &StoredName,
    node: &Arc<ZoneNode>,
    new_next: &StoredName,
    registry: &KeyRegistry,
    window: ValidityWindow,
) -> Result<Vec<OwnedRr>, EngineError> {
    let existing = node.rrsets.get(Rtype::NSEC);
    let Some(ZoneRecordData::Nsec(old)) = existing.records().first().map(|r| &r.rdata) else {
        return Ok(Vec::new());
    };
    let nsec = Nsec::new(new_next.clone(), old.types().clone());
    let ttl = existing.ttl().unwrap_or(domain::base::Ttl::from_secs(3600));
    let rr = OwnedRr::new(node.name.clone(), domain::base::iana::Class::IN, ttl, ZoneRecordData::Nsec(nsec));
    node.rrsets.set(&node.name, vec![rr.clone()])?;
    let rrset = crate::rr::RRSet::from_records(vec![rr.clone()])?;
    let sigs = sign_rrset(apex, &node.name, &rrset, registry, window, false)?;
    node.rrsets.add_or_update_rrsig(sigs.clone());
    let mut out = vec![rr];
    out.extend(sigs);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32hex_matches_known_vector() {
        // RFC 4648 §10 test vectors, re-expressed lowercase for base32hex.
        assert_eq!(base32hex_lower(b""), "");
        assert_eq!(base32hex_lower(b"f"), "co");
        assert_eq!(base32hex_lower(b"fo"), "cpng");
        assert_eq!(base32hex_lower(b"foo"), "cpnmu");
    }

    #[test]
    fn nsec3_params_reject_out_of_range() {
        let apex: StoredName = "example.".parse().unwrap();
        assert!(validate_nsec3_params(&apex, 50, &[0u8; 32]).is_ok());
        assert!(validate_nsec3_params(&apex, 51, &[]).is_err());
        assert!(validate_nsec3_params(&apex, 0, &[0u8; 33]).is_err());
    }
}
