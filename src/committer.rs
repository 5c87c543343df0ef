//! Component F: the zone committer.
//!
//! Finishes every mutation batch: bumps the SOA serial, re-signs the new
//! SOA in a signed zone, stamps deletion times, and appends the batch to
//! IXFR history in canonical order (spec §4.F).
//!
//! Grounded on `examples/NLnetLabs-cascade/src/units/zone_signer.rs`'s SOA
//! rebuild (`Soa::new(mname, rname, serial, refresh, retry, expire,
//! minimum)`, `Serial::from(soa.serial().into_int())`) for how a new SOA is
//! derived from the old one, adapted to the spec's own wrap rule (`u32::MAX`
//! wraps to `1`, not `0`, since serial `0` is conventionally never used).

use bytes::Bytes;
use domain::base::iana::Class;
use domain::base::Serial;
use domain::rdata::{Soa, ZoneRecordData};
use jiff::Timestamp;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::history::{retention_bound, HistoryBatch, HistoryRow, ZoneHistory};
use crate::rr::{OwnedRr, StoredName};
use crate::signer::{sign_rrset, ValidityWindow};
use crate::keys::KeyRegistry;
use crate::zonetree::ZoneTree;

/// The ordered material one commit contributes to history, built by the
/// caller (the Public Mutation API or the lifecycle engine) before handing
/// off to [`commit`]/[`commit_new_soa`].
#[derive(Default)]
pub struct PendingChange {
    pub deleted: Vec<OwnedRr>,
    pub added: Vec<OwnedRr>,
}

impl PendingChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, other: PendingChange) {
        self.deleted.extend(other.deleted);
        self.added.extend(other.added);
    }
}

/// `next_serial` per spec §4.F step 1: old+1, wrapping `u32::MAX` to `1`
/// rather than `0` (spec §3: "wrap from u32::MAX to 1").
pub fn next_serial(old: Serial) -> Serial {
    let old = old.into_int();
    let next = if old == u32::MAX { 1 } else { old.wrapping_add(1) };
    Serial::from(next)
}

/// Result of a successful commit: the new SOA serial and the records that
/// became part of this commit's history.
pub struct CommitOutcome {
    pub new_serial: Serial,
    pub history_batch: HistoryBatch,
}

/// Runs the whole-commit sequence of spec §4.F for an ordinary mutation:
/// the new SOA is the old one with only its serial bumped. `change` carries
/// whatever the caller already deleted/added from the RRSet store *before*
/// calling this.
#[allow(clippy::too_many_arguments)]
pub fn commit(
    tree: &ZoneTree,
    apex: &StoredName,
    change: PendingChange,
    signed: bool,
    registry: &KeyRegistry,
    history: &ZoneHistory,
    window: ValidityWindow,
    now: Timestamp,
    history_retention_extra: std::time::Duration,
    internal: bool,
) -> Result<CommitOutcome, EngineError> {
    let apex_node = tree.find_exact(apex).expect("apex node always exists");
    let old_soa_set = apex_node.rrsets.get(domain::base::iana::Rtype::SOA);
    let Some(old_soa_rr) = old_soa_set.records().first().cloned() else {
        return Err(EngineError::InvalidOperation {
            zone: apex.clone(),
            reason: "cannot commit a zone with no SOA".into(),
        });
    };
    let ZoneRecordData::Soa(old_soa) = &old_soa_rr.rdata else {
        return Err(EngineError::InvalidOperation {
            zone: apex.clone(),
            reason: "apex SOA record has the wrong rdata type".into(),
        });
    };

    if internal {
        debug!(zone = %apex, "internal zone commit: skipping serial bump and history");
        return Ok(CommitOutcome {
            new_serial: old_soa.serial(),
            history_batch: HistoryBatch::default(),
        });
    }

    let new_serial = next_serial(old_soa.serial());
    let new_soa = Soa::new(
        old_soa.mname().clone(),
        old_soa.rname().clone(),
        new_serial,
        old_soa.refresh(),
        old_soa.retry(),
        old_soa.expire(),
        old_soa.minimum(),
    );
    let new_soa_rr = OwnedRr::new(
        apex.clone(),
        Class::IN,
        old_soa_rr.ttl,
        ZoneRecordData::Soa(new_soa),
    );
    apex_node.rrsets.set(apex, vec![new_soa_rr.clone()])?;

    finalize(
        tree,
        apex,
        old_soa_rr,
        new_soa_rr,
        old_soa.expire(),
        change,
        signed,
        registry,
        history,
        window,
        now,
        history_retention_extra,
        new_serial,
    )
}

/// Runs the commit sequence for `set(SOA, ...)` (spec §4.H): the caller
/// supplies every SOA field *except* the serial, which is still bumped here
/// so a direct `set` can never skip the monotonicity invariant (spec §8
/// property 1).
#[allow(clippy::too_many_arguments)]
pub fn commit_new_soa(
    tree: &ZoneTree,
    apex: &StoredName,
    caller_soa: Soa<Bytes, StoredName>,
    ttl: domain::base::Ttl,
    change: PendingChange,
    signed: bool,
    registry: &KeyRegistry,
    history: &ZoneHistory,
    window: ValidityWindow,
    now: Timestamp,
    history_retention_extra: std::time::Duration,
) -> Result<CommitOutcome, EngineError> {
    let apex_node = tree.find_exact(apex).expect("apex node always exists");
    let old_soa_set = apex_node.rrsets.get(domain::base::iana::Rtype::SOA);
    let Some(old_soa_rr) = old_soa_set.records().first().cloned() else {
        return Err(EngineError::InvalidOperation {
            zone: apex.clone(),
            reason: "cannot commit a zone with no SOA".into(),
        });
    };
    let ZoneRecordData::Soa(old_soa) = &old_soa_rr.rdata else {
        return Err(EngineError::InvalidOperation {
            zone: apex.clone(),
            reason: "apex SOA record has the wrong rdata type".into(),
        });
    };

    let new_serial = next_serial(old_soa.serial());
    let new_soa = Soa::new(
        caller_soa.mname().clone(),
        caller_soa.rname().clone(),
        new_serial,
        caller_soa.refresh(),
        caller_soa.retry(),
        caller_soa.expire(),
        caller_soa.minimum(),
    );
    let new_soa_rr = OwnedRr::new(apex.clone(), Class::IN, ttl, ZoneRecordData::Soa(new_soa));
    apex_node.rrsets.set(apex, vec![new_soa_rr.clone()])?;

    finalize(
        tree,
        apex,
        old_soa_rr,
        new_soa_rr,
        caller_soa.expire(),
        change,
        signed,
        registry,
        history,
        window,
        now,
        history_retention_extra,
        new_serial,
    )
}

/// Shared tail of both commit entry points: re-sign the (already-installed)
/// new SOA RRset, stamp deletion times, fold everything into history rows
/// in IXFR order, and prune.
#[allow(clippy::too_many_arguments)]
fn finalize(
    tree: &ZoneTree,
    apex: &StoredName,
    old_soa_rr: OwnedRr,
    new_soa_rr: OwnedRr,
    soa_expire: domain::base::Ttl,
    mut change: PendingChange,
    signed: bool,
    registry: &KeyRegistry,
    history: &ZoneHistory,
    window: ValidityWindow,
    now: Timestamp,
    history_retention_extra: std::time::Duration,
    new_serial: Serial,
) -> Result<CommitOutcome, EngineError> {
    let apex_node = tree.find_exact(apex).expect("apex node always exists");

    let old_soa_rrsigs: Vec<OwnedRr> = apex_node
        .rrsets
        .get(domain::base::iana::Rtype::RRSIG)
        .records()
        .iter()
        .filter(|rr| {
            matches!(&rr.rdata, ZoneRecordData::Rrsig(sig)
                if sig.type_covered() == domain::base::iana::Rtype::SOA)
        })
        .cloned()
        .collect();

    let mut new_soa_rrsigs = Vec::new();
    if signed {
        let rrset = apex_node.rrsets.get(domain::base::iana::Rtype::SOA);
        new_soa_rrsigs = sign_rrset(apex, apex, &rrset, registry, window, false)?;
        apex_node.rrsets.add_or_update_rrsig(new_soa_rrsigs.clone());
    }

    let mut stamped_old_soa = old_soa_rr;
    stamped_old_soa.info.deleted_at = Some(now);
    change.deleted.insert(0, stamped_old_soa);
    for rr in &mut change.deleted {
        if rr.info.deleted_at.is_none() {
            rr.info.deleted_at = Some(now);
        }
        for glue in &mut rr.info.glue {
            if glue.info.deleted_at.is_none() {
                glue.info.deleted_at = Some(now);
            }
        }
    }
    change.deleted.extend(old_soa_rrsigs.into_iter().map(|mut rr| {
        rr.info.deleted_at = Some(now);
        rr
    }));
    change.added.push(new_soa_rr);
    change.added.extend(new_soa_rrsigs);

    let mut rows = Vec::with_capacity(change.deleted.len() + change.added.len());
    for rr in change.deleted {
        rows.push(HistoryRow {
            serial: new_serial.into_int(),
            record: rr,
            is_deletion: true,
        });
    }
    for rr in change.added {
        rows.push(HistoryRow {
            serial: new_serial.into_int(),
            record: rr,
            is_deletion: false,
        });
    }
    let batch = HistoryBatch {
        serial: new_serial.into_int(),
        rows,
    };

    let largest_ttl = batch
        .rows
        .iter()
        .map(|r| r.record.ttl.as_secs())
        .max()
        .unwrap_or(0);
    let retention = retention_bound(soa_expire.as_secs(), largest_ttl, history_retention_extra);
    history.append(batch.clone(), now, retention);

    info!(zone = %apex, serial = new_serial.into_int(), "committed zone change");

    Ok(CommitOutcome {
        new_serial,
        history_batch: batch,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use domain::base::Ttl;

    use super::*;
    use crate::history::ZoneHistory;
    use crate::keys::KeyRegistry;

    fn apex() -> StoredName {
        StoredName::from_str("example.").unwrap()
    }

    fn install_soa(tree: &ZoneTree, serial: u32) {
        let node = tree.find_exact(&apex()).unwrap();
        let soa = Soa::new(
            apex(),
            apex(),
            Serial::from(serial),
            Ttl::from_secs(900),
            Ttl::from_secs(300),
            Ttl::from_secs(604_800),
            Ttl::from_secs(900),
        );
        node.rrsets
            .set(&apex(), vec![OwnedRr::new(apex(), Class::IN, Ttl::from_secs(900), ZoneRecordData::Soa(soa))])
            .unwrap();
    }

    #[test]
    fn serial_wraps_max_to_one() {
        assert_eq!(next_serial(Serial::from(u32::MAX)).into_int(), 1);
        assert_eq!(next_serial(Serial::from(5)).into_int(), 6);
    }

    #[test]
    fn commit_bumps_serial_and_appends_history() {
        let tree = ZoneTree::new(apex());
        install_soa(&tree, 1);
        let registry = KeyRegistry::new();
        let history = ZoneHistory::new();
        let window = ValidityWindow::compute(1_700_000_000, std::time::Duration::from_secs(3600), 604_800, std::time::Duration::from_secs(3 * 86_400));
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let outcome = commit(
            &tree,
            &apex(),
            PendingChange::new(),
            false,
            &registry,
            &history,
            window,
            now,
            std::time::Duration::ZERO,
            false,
        )
        .unwrap();

        assert_eq!(outcome.new_serial.into_int(), 2);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn internal_zone_skips_serial_bump_and_history() {
        let tree = ZoneTree::new(apex());
        install_soa(&tree, 1);
        let registry = KeyRegistry::new();
        let history = ZoneHistory::new();
        let window = ValidityWindow::compute(1_700_000_000, std::time::Duration::from_secs(3600), 604_800, std::time::Duration::from_secs(3 * 86_400));
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let outcome = commit(
            &tree,
            &apex(),
            PendingChange::new(),
            false,
            &registry,
            &history,
            window,
            now,
            std::time::Duration::ZERO,
            true,
        )
        .unwrap();

        assert_eq!(outcome.new_serial.into_int(), 1);
        assert!(history.is_empty());
    }

    #[test]
    fn commit_new_soa_applies_caller_fields_but_bumps_serial() {
        let tree = ZoneTree::new(apex());
        install_soa(&tree, 41);
        let registry = KeyRegistry::new();
        let history = ZoneHistory::new();
        let window = ValidityWindow::compute(1_700_000_000, std::time::Duration::from_secs(3600), 604_800, std::time::Duration::from_secs(3 * 86_400));
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let caller_soa = Soa::new(
            apex(),
            apex(),
            Serial::from(999), // ignored: serial is always derived from the old one
            Ttl::from_secs(1800),
            Ttl::from_secs(600),
            Ttl::from_secs(1_209_600),
            Ttl::from_secs(1800),
        );

        let outcome = commit_new_soa(
            &tree,
            &apex(),
            caller_soa,
            Ttl::from_secs(1800),
            PendingChange::new(),
            false,
            &registry,
            &history,
            window,
            now,
            std::time::Duration::ZERO,
        )
        .unwrap();

        assert_eq!(outcome.new_serial.into_int(), 42);
        let node = tree.find_exact(&apex()).unwrap();
        let ZoneRecordData::Soa(installed) = &node.rrsets.get(domain::base::iana::Rtype::SOA).records()[0].rdata else {
            unreachable!()
        };
        assert_eq!(installed.refresh(), Ttl::from_secs(1800));
        assert_eq!(installed.serial().into_int(), 42);
    }
}
