//! Component H: the Public Mutation API, and the apex zone that owns every
//! other component.
//!
//! `ApexZone` is the entry point a hosting process holds one of per signed
//! (or unsigned, or internal) zone: it wires the RRSet Store/Zone Tree (A/B)
//! to the Signer (C), Denial Builder (D), Key Lifecycle Engine (E),
//! Committer (F), and Notify Dispatcher (G) behind the mutation surface and
//! signing verbs spec §4.H names.
//!
//! Grounded on `examples/NLnetLabs-cascade/src/zone/mod.rs`'s `Zone`/`ZoneState`
//! shape (one struct per zone owning its own locks, status, and policy) and
//! on `units/zone_signer.rs`'s `ZoneSigner::launch` for "spawn a background
//! task that the zone's own methods feed" as the model for the lifecycle
//! timer wiring.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Rtype};
use domain::base::Ttl;
use domain::rdata::ZoneRecordData;
use jiff::Timestamp;
use tracing::{info, warn};

use crate::committer::{self, PendingChange};
use crate::config::EngineConfig;
use crate::denial;
use crate::error::EngineError;
use crate::history::ZoneHistory;
use crate::interfaces::{DsLookup, NotifyTransport, ZonePersister};
use crate::keys::lifecycle::{self, LifecycleAction, LifecycleTimer};
use crate::keys::{generate_key, KeyAlgorithm, KeyKind, KeyRegistry, KeyState};
use crate::notify::{NotifyDispatcher, NotifyPolicy};
use crate::rr::{OwnedRr, RRSet, StoredName, StoredRecordData};
use crate::signer::{sign_rrset, ValidityWindow};
use crate::zonetree::ZoneTree;

/// A zone's DNSSEC status (spec §3: "DNSSEC status ∈ {Unsigned,
/// SignedWithNSEC, SignedWithNSEC3}").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnssecStatus {
    Unsigned,
    SignedWithNsec,
    SignedWithNsec3,
}

/// Which denial-of-existence chain `sign-zone`/`convert-to-*` should build
/// or rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenialKind {
    Nsec,
    Nsec3 { iterations: u16, salt: Vec<u8> },
}

/// Currently-active NSEC3 chain parameters, tracked so incremental relinks
/// and `update-nsec3-params` know what to rebuild (spec §4.D).
struct Nsec3State {
    iterations: u16,
    salt: Vec<u8>,
    ents: Vec<StoredName>,
}

/// Record types the Public Mutation API refuses outright because the
/// DNSSEC machinery owns them exclusively (spec §4.H).
const DNSSEC_MANAGED_TYPES: &[Rtype] = &[
    Rtype::DNSKEY,
    Rtype::RRSIG,
    Rtype::NSEC,
    Rtype::NSEC3,
    Rtype::NSEC3PARAM,
];

fn is_unsupported_in_signed_zone(rtype: Rtype) -> bool {
    matches!(rtype.to_string().as_str(), "ANAME" | "APP")
}

/// One apex zone and everything it owns: the zone tree, key registry,
/// history log, DNSSEC status, and the collaborators it calls out to (spec
/// §2 data flow: H -> A -> C -> D -> F -> G).
pub struct ApexZone {
    pub apex: StoredName,
    pub tree: ZoneTree,
    pub keys: KeyRegistry,
    pub history: ZoneHistory,
    pub config: EngineConfig,

    status: Mutex<DnssecStatus>,
    nsec3_state: Mutex<Option<Nsec3State>>,
    algorithm: Mutex<Option<KeyAlgorithm>>,
    dnskey_ttl: Mutex<Duration>,
    last_refresh_check: Mutex<Option<Timestamp>>,

    /// Guards the entirety of a whole-zone NSEC/NSEC3 (dis)enable or
    /// (de)conversion (spec §5: "Zone apex DNSSEC-update lock"). Never held
    /// across the async lifecycle-tick's DS lookup or any NOTIFY send.
    dnssec_update_lock: Mutex<()>,

    pub internal: bool,
    disabled: std::sync::atomic::AtomicBool,
    notify_policy: Mutex<NotifyPolicy>,
    notify_list: Mutex<Vec<SocketAddr>>,
    pub tsig_allow_list: Mutex<Vec<String>>,

    persister: Arc<dyn ZonePersister>,
    ds_lookup: Arc<dyn DsLookup>,
    notify: Arc<NotifyDispatcher>,
    lifecycle_timer: Mutex<Option<LifecycleTimer>>,
}

impl ApexZone {
    pub fn new(
        apex: StoredName,
        config: EngineConfig,
        persister: Arc<dyn ZonePersister>,
        ds_lookup: Arc<dyn DsLookup>,
        notify_transport: Arc<dyn NotifyTransport>,
    ) -> Arc<Self> {
        let notify = NotifyDispatcher::new(
            notify_transport,
            config.notify_coalesce_delay,
            config.notify_timeout,
            config.notify_retries,
        );
        Arc::new(Self {
            tree: ZoneTree::new(apex.clone()),
            apex,
            keys: KeyRegistry::new(),
            history: ZoneHistory::new(),
            status: Mutex::new(DnssecStatus::Unsigned),
            nsec3_state: Mutex::new(None),
            algorithm: Mutex::new(None),
            dnskey_ttl: Mutex::new(Duration::from_secs(3600)),
            last_refresh_check: Mutex::new(None),
            dnssec_update_lock: Mutex::new(()),
            internal: false,
            disabled: std::sync::atomic::AtomicBool::new(false),
            notify_policy: Mutex::new(NotifyPolicy::None),
            notify_list: Mutex::new(Vec::new()),
            tsig_allow_list: Mutex::new(Vec::new()),
            config,
            persister,
            ds_lookup,
            notify,
            lifecycle_timer: Mutex::new(None),
        })
    }

    pub fn status(&self) -> DnssecStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_signed(&self) -> bool {
        self.status() != DnssecStatus::Unsigned
    }

    pub fn set_notify_policy(&self, policy: NotifyPolicy) {
        *self.notify_policy.lock().unwrap() = policy;
    }

    pub fn set_notify_list(&self, targets: Vec<SocketAddr>) {
        *self.notify_list.lock().unwrap() = targets;
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, std::sync::atomic::Ordering::SeqCst);
        if disabled {
            self.notify.cancel_pending_arm();
        }
    }

    // -- helpers -----------------------------------------------------

    fn soa_expire(&self) -> u32 {
        self.tree
            .find_exact(&self.apex)
            .and_then(|node| {
                node.rrsets
                    .get(Rtype::SOA)
                    .records()
                    .first()
                    .and_then(|rr| match &rr.rdata {
                        ZoneRecordData::Soa(soa) => Some(soa.expire().as_secs()),
                        _ => None,
                    })
            })
            .unwrap_or(604_800)
    }

    fn current_window(&self, now: Timestamp) -> ValidityWindow {
        ValidityWindow::compute(
            now.as_second() as u32,
            self.config.signature_inception_offset,
            self.soa_expire(),
            self.config.signature_validity_margin,
        )
    }

    fn after_commit(&self, outcome: &committer::CommitOutcome) {
        let apex = self.apex.clone();
        let persister = Arc::clone(&self.persister);
        tokio::spawn(async move { persister.save_zone(&apex).await });

        if self.disabled.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let policy = self.notify_policy.lock().unwrap().clone();
        if policy == NotifyPolicy::None {
            return;
        }
        let targets = crate::notify::compute_targets(
            &policy,
            &self.ns_glue_addresses(),
            &self.notify_list.lock().unwrap(),
        );
        self.notify
            .trigger(self.apex.clone(), outcome.new_serial.into_int(), targets);
    }

    /// Addresses glued onto the apex NS RRset (spec §4.G: "zone-name-servers-from-NS-RRSet").
    fn ns_glue_addresses(&self) -> Vec<SocketAddr> {
        let Some(node) = self.tree.find_exact(&self.apex) else {
            return Vec::new();
        };
        node.rrsets
            .get(Rtype::NS)
            .records()
            .iter()
            .flat_map(|rr| rr.info.glue.iter())
            .filter_map(|glue| match &glue.rdata {
                ZoneRecordData::A(addr) => Some(SocketAddr::new(addr.addr().into(), 53)),
                ZoneRecordData::Aaaa(addr) => Some(SocketAddr::new(addr.addr().into(), 53)),
                _ => None,
            })
            .collect()
    }

    fn validate_owner_and_type(&self, owner: &StoredName, rtype: Rtype) -> Result<(), EngineError> {
        if DNSSEC_MANAGED_TYPES.contains(&rtype) {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: format!("{rtype} records are managed by the DNSSEC engine and cannot be mutated directly"),
            });
        }
        if owner == &self.apex && rtype == Rtype::DS {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "DS records are not valid at the zone apex".into(),
            });
        }
        if owner == &self.apex && rtype == Rtype::CNAME {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "CNAME is not valid at the zone apex".into(),
            });
        }
        if self.is_signed() && is_unsupported_in_signed_zone(rtype) {
            return Err(EngineError::UnsupportedInSignedZone {
                zone: self.apex.clone(),
                rtype,
            });
        }
        Ok(())
    }

    fn validate_ttl(&self, ttl: Ttl) -> Result<(), EngineError> {
        if ttl.as_secs() > self.soa_expire() {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: format!(
                    "TTL {} exceeds the zone's SOA expire value {}",
                    ttl.as_secs(),
                    self.soa_expire()
                ),
            });
        }
        Ok(())
    }

    // -- component H: public mutation API -----------------------------

    /// `set(SOA, records)` (spec §4.H): exactly one record, owner == apex,
    /// original-TTL ≤ SOA.expire; on a `minimum` change, the denial chain is
    /// rebuilt with the new TTL.
    pub fn set_soa(&self, record: OwnedRr) -> Result<RRSet, EngineError> {
        if record.owner != self.apex {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "SOA must be set at the zone apex".into(),
            });
        }
        let ZoneRecordData::Soa(new_soa) = record.rdata.clone() else {
            return Err(EngineError::InvalidRRSet {
                zone: self.apex.clone(),
                reason: "set(SOA, ...) requires SOA rdata".into(),
            });
        };
        if record.ttl.as_secs() > new_soa.expire().as_secs() {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "SOA original-TTL exceeds SOA.expire".into(),
            });
        }

        let apex_node = self.tree.find_exact(&self.apex).expect("apex node always exists");
        let old_minimum = apex_node
            .rrsets
            .get(Rtype::SOA)
            .records()
            .first()
            .and_then(|rr| match &rr.rdata {
                ZoneRecordData::Soa(soa) => Some(soa.minimum()),
                _ => None,
            });

        let now = Timestamp::now();
        let window = self.current_window(now);
        let mut change = PendingChange::new();

        if self.is_signed() && old_minimum != Some(new_soa.minimum()) {
            change.extend(self.rebuild_current_denial_chain(window)?);
        }

        let outcome = committer::commit_new_soa(
            &self.tree,
            &self.apex,
            new_soa,
            record.ttl,
            change,
            self.is_signed(),
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
        )?;
        self.after_commit(&outcome);
        Ok(apex_node.rrsets.get(Rtype::SOA))
    }

    /// `set(type, records) -> deleted-records`.
    pub fn set(&self, owner: &StoredName, records: Vec<OwnedRr>) -> Result<RRSet, EngineError> {
        let Some(rtype) = records.first().map(OwnedRr::rtype) else {
            return Err(EngineError::InvalidRRSet {
                zone: self.apex.clone(),
                reason: "set() requires at least one record".into(),
            });
        };
        if rtype == Rtype::SOA {
            return self.set_soa(records.into_iter().next().unwrap());
        }
        self.validate_owner_and_type(owner, rtype)?;
        for rr in &records {
            self.validate_ttl(rr.ttl)?;
            if self.is_signed() && rr.info.disabled {
                return Err(EngineError::InvalidOperation {
                    zone: self.apex.clone(),
                    reason: "cannot add a disabled record in a signed zone".into(),
                });
            }
        }

        let node = self.tree.get_or_add(owner);
        let new_records = records.clone();
        let old = node.rrsets.set(owner, records)?;
        let mut change = PendingChange::new();
        change.deleted.extend(old.records().iter().cloned());
        change.added.extend(new_records);
        self.finish_mutation(owner, rtype, change)?;
        Ok(old)
    }

    /// `add(record) -> appended`.
    pub fn add(&self, record: OwnedRr) -> Result<OwnedRr, EngineError> {
        let rtype = record.rtype();
        if rtype == Rtype::SOA {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "use set(SOA, ...), not add(), for the SOA record".into(),
            });
        }
        self.validate_owner_and_type(&record.owner, rtype)?;
        self.validate_ttl(record.ttl)?;
        if self.is_signed() && record.info.disabled {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "cannot add a disabled record in a signed zone".into(),
            });
        }

        let owner = record.owner.clone();
        let node = self.tree.get_or_add(&owner);
        let appended = node.rrsets.add(record)?;
        let mut change = PendingChange::new();
        change.added.push(appended.clone());
        self.finish_mutation(&owner, rtype, change)?;
        Ok(appended)
    }

    /// `delete(type) -> deleted-records`.
    pub fn delete(&self, owner: &StoredName, rtype: Rtype) -> Result<RRSet, EngineError> {
        if rtype == Rtype::SOA {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "the SOA record cannot be deleted".into(),
            });
        }
        self.validate_owner_and_type(owner, rtype)?;
        let node = self.tree.get_or_add(owner);
        let deleted = node.rrsets.delete(rtype);
        let mut change = PendingChange::new();
        change.deleted.extend(deleted.records().iter().cloned());
        self.finish_mutation(owner, rtype, change)?;
        Ok(deleted)
    }

    /// `delete(type, rdata) -> deleted-record-or-none`.
    pub fn delete_rdata(
        &self,
        owner: &StoredName,
        rtype: Rtype,
        rdata: &crate::rr::StoredRecordData,
    ) -> Result<Option<OwnedRr>, EngineError> {
        if rtype == Rtype::SOA {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "the SOA record cannot be deleted".into(),
            });
        }
        self.validate_owner_and_type(owner, rtype)?;
        let node = self.tree.get_or_add(owner);
        let Some(removed) = node.rrsets.delete_rdata(rtype, rdata) else {
            return Ok(None);
        };
        let mut change = PendingChange::new();
        change.deleted.push(removed.clone());
        self.finish_mutation(owner, rtype, change)?;
        Ok(Some(removed))
    }

    /// Attaches in-bailiwick glue addresses to an NS record already present
    /// at `owner` (spec §3 "glue list (for NS)"), replacing whatever glue it
    /// previously carried. Feeds both `ns_glue_addresses` (NOTIFY target
    /// computation) and IXFR history rows, which carry the NS record's glue
    /// alongside it (spec §4.F step 5).
    pub fn attach_ns_glue(
        &self,
        owner: &StoredName,
        ns_rdata: StoredRecordData,
        glue: Vec<OwnedRr>,
    ) -> Result<(), EngineError> {
        self.validate_owner_and_type(owner, Rtype::NS)?;
        let node = self.tree.get_or_add(owner);
        let (old_glue, new_glue) = node.rrsets.set_ns_glue(&ns_rdata, glue)?;
        let mut change = PendingChange::new();
        change.deleted.extend(old_glue);
        change.added.extend(new_glue);
        self.finish_mutation(owner, Rtype::NS, change)?;
        Ok(())
    }

    /// Shared tail of `set`/`add`/`delete`/`delete_rdata`: re-sign the
    /// mutated RRset, relink the owner's denial record if the zone is
    /// signed, then run the committer and notify dispatcher (spec §4.H,
    /// "On success").
    fn finish_mutation(&self, owner: &StoredName, rtype: Rtype, mut change: PendingChange) -> Result<(), EngineError> {
        let now = Timestamp::now();
        let window = self.current_window(now);

        if self.is_signed() {
            let node = self.tree.get_or_add(owner);
            let current = node.rrsets.get(rtype);
            let is_delegation_ns = rtype == Rtype::NS && owner != &self.apex;
            if !current.is_empty() {
                match sign_rrset(&self.apex, owner, &current, &self.keys, window, is_delegation_ns) {
                    Ok(new_sigs) => {
                        let replaced = node.rrsets.add_or_update_rrsig(new_sigs.clone());
                        change.deleted.extend(replaced);
                        change.added.extend(new_sigs);
                    }
                    Err(EngineError::NoSigningKey { .. }) if is_delegation_ns => {}
                    Err(e) => return Err(e),
                }
            } else {
                // `rtype`'s RRset just emptied out but the owner still holds
                // other types, so its RRSIG set would otherwise never get
                // cleaned up.
                change.deleted.extend(node.rrsets.remove_rrsigs_covering(rtype));
            }
            change.extend(self.relink_denial(owner, window)?);
        }

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            self.is_signed(),
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    /// Incremental denial relink for the current chain type (spec §4.D
    /// "Incremental relink"). NSEC relinks exactly the touched owner and its
    /// predecessor link; NSEC3 recomputes the whole chain (see `DESIGN.md`'s
    /// documented simplification).
    fn relink_denial(&self, owner: &StoredName, window: ValidityWindow) -> Result<PendingChange, EngineError> {
        let mut change = PendingChange::new();
        match self.status() {
            DnssecStatus::SignedWithNsec => {
                change.extend(denial::relink_nsec(&self.tree, &self.apex, owner, &self.keys, window)?);
            }
            DnssecStatus::SignedWithNsec3 => {
                change.extend(self.rebuild_current_denial_chain(window)?);
            }
            DnssecStatus::Unsigned => {}
        }
        Ok(change)
    }

    /// Disables then re-enables whatever denial chain is currently active,
    /// with its current parameters. Used both by NSEC3's relink path and by
    /// `set(SOA)`'s minimum-change path.
    fn rebuild_current_denial_chain(&self, window: ValidityWindow) -> Result<PendingChange, EngineError> {
        let mut change = PendingChange::new();
        match self.status() {
            DnssecStatus::SignedWithNsec => {
                change.deleted.extend(denial::disable_nsec(&self.tree));
                let produced = denial::enable_nsec(&self.tree, &self.apex, &self.keys, window)?;
                for (_, recs) in produced {
                    change.added.extend(recs);
                }
            }
            DnssecStatus::SignedWithNsec3 => {
                let (iterations, salt, ents) = {
                    let state = self.nsec3_state.lock().unwrap();
                    let Some(state) = state.as_ref() else {
                        return Ok(change);
                    };
                    (state.iterations, state.salt.clone(), state.ents.clone())
                };
                change.deleted.extend(denial::disable_nsec3(&self.tree, &self.apex, &ents));
                let (produced, new_ents) =
                    denial::enable_nsec3(&self.tree, &self.apex, iterations, &salt, &self.keys, window)?;
                for (_, recs) in produced {
                    change.added.extend(recs);
                }
                *self.nsec3_state.lock().unwrap() = Some(Nsec3State {
                    iterations,
                    salt,
                    ents: new_ents,
                });
            }
            DnssecStatus::Unsigned => {}
        }
        Ok(change)
    }

    // -- signing verbs -------------------------------------------------

    /// `sign-zone(algorithm, params, nx-proof, dns-key-ttl, zsk-rollover-days)`
    /// (spec §4.H). Requires current status Unsigned.
    pub fn sign_zone(
        &self,
        algorithm: KeyAlgorithm,
        denial_kind: DenialKind,
        dnskey_ttl: Duration,
        zsk_rollover_days: u32,
    ) -> Result<(), EngineError> {
        if self.is_signed() {
            return Err(EngineError::ZoneAlreadySigned { zone: self.apex.clone() });
        }
        let result = self.try_sign_zone(algorithm, denial_kind, dnskey_ttl, zsk_rollover_days);
        if result.is_err() {
            // spec §7: roll back status and clear the key registry on any
            // crypto/signing failure inside a whole-zone sign.
            self.keys.clear();
            *self.status.lock().unwrap() = DnssecStatus::Unsigned;
            *self.nsec3_state.lock().unwrap() = None;
        }
        result
    }

    fn try_sign_zone(
        &self,
        algorithm: KeyAlgorithm,
        denial_kind: DenialKind,
        dnskey_ttl: Duration,
        zsk_rollover_days: u32,
    ) -> Result<(), EngineError> {
        let now = Timestamp::now();

        let mut ksk = generate_key(&self.apex, KeyKind::Ksk, algorithm, now)?;
        ksk.transition(KeyState::Ready, now);
        let mut zsk = generate_key(&self.apex, KeyKind::Zsk, algorithm, now)?;
        zsk.transition(KeyState::Ready, now);
        zsk.rollover_days = zsk_rollover_days;

        self.keys.insert_unique(&self.apex, ksk)?;
        let zsk_tag = self.keys.insert_unique(&self.apex, zsk)?;

        *self.dnskey_ttl.lock().unwrap() = dnskey_ttl;
        *self.algorithm.lock().unwrap() = Some(algorithm);

        let ttl = Ttl::from_secs(dnskey_ttl.as_secs() as u32);
        self.publish_dnskey_rrset(ttl)?;

        let window = self.current_window(now);
        let mut change = PendingChange::new();

        for node in self.tree.all_in_canonical_order() {
            for rtype in node.rrsets.types_present() {
                if rtype == Rtype::RRSIG {
                    continue;
                }
                let rrset = node.rrsets.get(rtype);
                if rrset.is_empty() {
                    continue;
                }
                let is_delegation_ns = rtype == Rtype::NS && node.name != self.apex;
                let sigs = sign_rrset(&self.apex, &node.name, &rrset, &self.keys, window, is_delegation_ns)?;
                let replaced = node.rrsets.add_or_update_rrsig(sigs.clone());
                change.deleted.extend(replaced);
                change.added.extend(sigs);
            }
        }

        match denial_kind {
            DenialKind::Nsec => {
                let produced = denial::enable_nsec(&self.tree, &self.apex, &self.keys, window)?;
                for (_, recs) in produced {
                    change.added.extend(recs);
                }
                *self.status.lock().unwrap() = DnssecStatus::SignedWithNsec;
            }
            DenialKind::Nsec3 { iterations, salt } => {
                let (produced, ents) =
                    denial::enable_nsec3(&self.tree, &self.apex, iterations, &salt, &self.keys, window)?;
                for (_, recs) in produced {
                    change.added.extend(recs);
                }
                *self.nsec3_state.lock().unwrap() = Some(Nsec3State { iterations, salt, ents });
                *self.status.lock().unwrap() = DnssecStatus::SignedWithNsec3;
            }
        }

        self.keys.with_key_mut(zsk_tag, |k| k.transition(KeyState::Active, now));

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        info!(zone = %self.apex, status = ?self.status(), "zone signed");
        Ok(())
    }

    /// `unsign-zone`: removes all DNSKEY/RRSIG/NSEC/NSEC3/NSEC3PARAM
    /// records, cancels the timer, clears the key registry, commits.
    pub fn unsign_zone(&self) -> Result<(), EngineError> {
        if !self.is_signed() {
            return Err(EngineError::ZoneNotSigned { zone: self.apex.clone() });
        }
        let _guard = self.dnssec_update_lock.lock().unwrap();
        self.stop_lifecycle_timer();

        let now = Timestamp::now();
        let window = self.current_window(now);
        let mut change = PendingChange::new();

        match self.status() {
            DnssecStatus::SignedWithNsec => change.deleted.extend(denial::disable_nsec(&self.tree)),
            DnssecStatus::SignedWithNsec3 => {
                let ents = self
                    .nsec3_state
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|s| s.ents.clone())
                    .unwrap_or_default();
                change.deleted.extend(denial::disable_nsec3(&self.tree, &self.apex, &ents));
            }
            DnssecStatus::Unsigned => {}
        }
        *self.nsec3_state.lock().unwrap() = None;

        for node in self.tree.all_in_canonical_order() {
            change.deleted.extend(node.rrsets.delete(Rtype::DNSKEY).records().to_vec());
            change.deleted.extend(node.rrsets.delete(Rtype::RRSIG).records().to_vec());
        }

        self.keys.clear();
        *self.status.lock().unwrap() = DnssecStatus::Unsigned;

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            false,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        info!(zone = %self.apex, "zone unsigned");
        Ok(())
    }

    /// `convert-to-nsec`: requires current status SignedWithNSEC3.
    pub fn convert_to_nsec(&self) -> Result<(), EngineError> {
        if self.status() != DnssecStatus::SignedWithNsec3 {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "zone is not currently signed with NSEC3".into(),
            });
        }
        let _guard = self.dnssec_update_lock.lock().unwrap();
        let now = Timestamp::now();
        let window = self.current_window(now);

        let ents = self
            .nsec3_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.ents.clone())
            .unwrap_or_default();
        let mut change = PendingChange::new();
        change.deleted.extend(denial::disable_nsec3(&self.tree, &self.apex, &ents));
        *self.nsec3_state.lock().unwrap() = None;

        let produced = denial::enable_nsec(&self.tree, &self.apex, &self.keys, window)?;
        for (_, recs) in produced {
            change.added.extend(recs);
        }
        *self.status.lock().unwrap() = DnssecStatus::SignedWithNsec;

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    /// `convert-to-nsec3(iterations, salt)`: requires current status
    /// SignedWithNSEC.
    pub fn convert_to_nsec3(&self, iterations: u16, salt: Vec<u8>) -> Result<(), EngineError> {
        if self.status() != DnssecStatus::SignedWithNsec {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "zone is not currently signed with NSEC".into(),
            });
        }
        denial::validate_nsec3_params(&self.apex, iterations, &salt)?;
        let _guard = self.dnssec_update_lock.lock().unwrap();
        let now = Timestamp::now();
        let window = self.current_window(now);

        let mut change = PendingChange::new();
        change.deleted.extend(denial::disable_nsec(&self.tree));

        let (produced, ents) = denial::enable_nsec3(&self.tree, &self.apex, iterations, &salt, &self.keys, window)?;
        for (_, recs) in produced {
            change.added.extend(recs);
        }
        *self.nsec3_state.lock().unwrap() = Some(Nsec3State { iterations, salt, ents });
        *self.status.lock().unwrap() = DnssecStatus::SignedWithNsec3;

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    /// `update-nsec3-params(iterations, salt)`: atomically disables then
    /// rebuilds the current NSEC3 chain (spec §4.D).
    pub fn update_nsec3_params(&self, iterations: u16, salt: Vec<u8>) -> Result<(), EngineError> {
        if self.status() != DnssecStatus::SignedWithNsec3 {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "zone is not currently signed with NSEC3".into(),
            });
        }
        denial::validate_nsec3_params(&self.apex, iterations, &salt)?;
        let _guard = self.dnssec_update_lock.lock().unwrap();
        let now = Timestamp::now();
        let window = self.current_window(now);

        let ents = self
            .nsec3_state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.ents.clone())
            .unwrap_or_default();
        let mut change = PendingChange::new();
        change.deleted.extend(denial::disable_nsec3(&self.tree, &self.apex, &ents));

        let (produced, new_ents) =
            denial::enable_nsec3(&self.tree, &self.apex, iterations, &salt, &self.keys, window)?;
        for (_, recs) in produced {
            change.added.extend(recs);
        }
        *self.nsec3_state.lock().unwrap() = Some(Nsec3State {
            iterations,
            salt,
            ents: new_ents,
        });

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    // -- key management verbs -------------------------------------------

    /// `rollover(key-tag)` (spec §4.E).
    pub fn rollover(&self, key_tag: u16) -> Result<u16, EngineError> {
        let algorithm = self.algorithm.lock().unwrap().ok_or_else(|| EngineError::InvalidOperation {
            zone: self.apex.clone(),
            reason: "zone has no configured signing algorithm (is it signed?)".into(),
        })?;
        let now = Timestamp::now();
        let new_tag = lifecycle::rollover(&self.apex, &self.keys, key_tag, algorithm, now)?;
        self.resign_dnskey_and_commit(now)?;
        Ok(new_tag)
    }

    /// `revoke(key-tag)` (KSK only).
    pub fn revoke(&self, key_tag: u16) -> Result<u16, EngineError> {
        let now = Timestamp::now();
        let new_tag = lifecycle::revoke(&self.apex, &self.keys, key_tag, now)?;
        self.resign_dnskey_and_commit(now)?;
        Ok(new_tag)
    }

    /// `unpublish(key-tag)`: requires at least one DNSKEY remains.
    pub fn unpublish(&self, key_tag: u16) -> Result<(), EngineError> {
        if !self.keys.contains_tag(key_tag) {
            return Err(EngineError::KeyNotFound {
                zone: self.apex.clone(),
                key_tag,
            });
        }
        if self.keys.len() <= 1 {
            return Err(EngineError::InvalidOperation {
                zone: self.apex.clone(),
                reason: "at least one DNSKEY must remain published".into(),
            });
        }
        lifecycle::unpublish(&self.keys, key_tag);
        let now = Timestamp::now();
        self.resign_dnskey_and_commit(now)
    }

    fn publish_dnskey_rrset(&self, ttl: Ttl) -> Result<RRSet, EngineError> {
        let apex_node = self.tree.find_exact(&self.apex).expect("apex node always exists");
        let mut records = Vec::new();
        for (tag, _, _, _) in self.keys.snapshot() {
            if let Some(rr) = self.keys.with_key(tag, |k| {
                OwnedRr::new(self.apex.clone(), Class::IN, ttl, ZoneRecordData::Dnskey(k.dnskey_rdata()))
            }) {
                records.push(rr);
            }
        }
        apex_node.rrsets.set(&self.apex, records)
    }

    /// Rebuilds the DNSKEY RRset from the current registry contents and
    /// re-signs it, then commits — the common tail of every key-state
    /// change that alters who is eligible to sign DNSKEY (spec §4.E, each
    /// transition "bumps the serial exactly once").
    fn resign_dnskey_and_commit(&self, now: Timestamp) -> Result<(), EngineError> {
        let window = self.current_window(now);
        let ttl = Ttl::from_secs(self.dnskey_ttl.lock().unwrap().as_secs() as u32);

        let apex_node = self.tree.find_exact(&self.apex).expect("apex node always exists");
        let old_dnskey_rrsigs: Vec<OwnedRr> = apex_node
            .rrsets
            .get(Rtype::RRSIG)
            .records()
            .iter()
            .filter(|rr| matches!(&rr.rdata, ZoneRecordData::Rrsig(s) if s.type_covered() == Rtype::DNSKEY))
            .cloned()
            .collect();

        let old_dnskey = self.publish_dnskey_rrset(ttl)?;
        let new_dnskey = apex_node.rrsets.get(Rtype::DNSKEY);

        let mut change = PendingChange::new();
        change.deleted.extend(old_dnskey.records().iter().cloned());
        change.added.extend(new_dnskey.records().iter().cloned());

        if !new_dnskey.is_empty() {
            let sigs = sign_rrset(&self.apex, &self.apex, &new_dnskey, &self.keys, window, false)?;
            let replaced = apex_node.rrsets.add_or_update_rrsig(sigs.clone());
            change.deleted.extend(replaced);
            change.added.extend(sigs);
        } else {
            change.deleted.extend(old_dnskey_rrsigs);
        }

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    // -- key lifecycle timer --------------------------------------------

    /// Starts the spec §4.E timer (first tick 30s after signing/startup,
    /// then every 15 min).
    pub fn start_lifecycle_timer(self: &Arc<Self>) {
        let zone = Arc::clone(self);
        let config = self.config.clone();
        let timer = LifecycleTimer::spawn(config, move || {
            let zone = Arc::clone(&zone);
            tokio::spawn(async move { zone.run_lifecycle_tick().await });
        });
        *self.lifecycle_timer.lock().unwrap() = Some(timer);
    }

    /// Cancels the timer (spec §5, "on zone disposal: cancel timers").
    pub fn stop_lifecycle_timer(&self) {
        if let Some(timer) = self.lifecycle_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    /// Drains pending work and tears the zone down (spec §5,
    /// "Cancellation"). In-flight NOTIFYs are left to drain by their own
    /// timeout rather than forcefully aborted.
    pub fn dispose(&self) {
        self.stop_lifecycle_timer();
        self.notify.cancel_pending_arm();
    }

    /// One tick of the key lifecycle engine (spec §4.E): plan under the key
    /// registry lock, then apply each action as its own commit outside the
    /// lock, so a DS-lookup suspension never holds a zone lock.
    async fn run_lifecycle_tick(&self) {
        let now = Timestamp::now();
        let dnskey_ttl = *self.dnskey_ttl.lock().unwrap();
        let actions = lifecycle::plan(&self.apex, &self.keys, &self.config, dnskey_ttl, now, self.ds_lookup.as_ref()).await;

        let mut published_any = false;
        for action in actions {
            let outcome = match action {
                LifecycleAction::PublishGenerated(_) => {
                    if published_any {
                        continue;
                    }
                    published_any = true;
                    lifecycle::publish_all_generated(&self.keys, now);
                    self.resign_dnskey_and_commit(now)
                }
                LifecycleAction::MakeReady(tag) => {
                    lifecycle::apply_make_ready(&self.keys, tag, now);
                    self.resign_dnskey_and_commit(now)
                }
                LifecycleAction::Activate(tag) => {
                    lifecycle::apply_activate(&self.keys, tag, now);
                    self.resign_dnskey_and_commit(now)
                }
                LifecycleAction::Retire(tag) => {
                    lifecycle::apply_retire(&self.keys, tag, now);
                    self.resign_dnskey_and_commit(now)
                }
                LifecycleAction::Revoke(tag) => match lifecycle::revoke(&self.apex, &self.keys, tag, now) {
                    Ok(_) => self.resign_dnskey_and_commit(now),
                    Err(e) => Err(e),
                },
                LifecycleAction::Remove(tag) => {
                    lifecycle::apply_remove(&self.keys, tag);
                    self.resign_dnskey_and_commit(now)
                }
                LifecycleAction::RolloverDue { old, .. } => self.rollover(old).map(|_| ()),
                LifecycleAction::RefreshDue => Ok(()),
            };
            if let Err(err) = outcome {
                // spec §7: "Timer-loop exceptions are logged; the timer is
                // always rescheduled for the next periodic tick."
                warn!(zone = %self.apex, %err, "key lifecycle action failed, will retry next tick");
            }
        }

        if let Err(err) = self.maybe_refresh_signatures(now) {
            warn!(zone = %self.apex, %err, "signature refresh pass failed, will retry next tick");
        }
    }

    /// "Signature refresh" (spec §4.E): every `validity_period / 10`, walk
    /// every RRSIG and re-sign any whose remaining lifetime has dropped
    /// below `signature_refresh_remaining_fraction`.
    fn maybe_refresh_signatures(&self, now: Timestamp) -> Result<(), EngineError> {
        if !self.is_signed() {
            return Ok(());
        }
        let validity_period = Duration::from_secs(
            u64::from(self.soa_expire()) + self.config.signature_validity_margin.as_secs(),
        );
        let check_period = validity_period.mul_f64(self.config.signature_refresh_check_fraction);

        {
            let mut last = self.last_refresh_check.lock().unwrap();
            let due = match *last {
                None => true,
                Some(prev) => now.duration_since(prev).is_positive()
                    && std::time::Duration::try_from(now.duration_since(prev)).unwrap_or_default() >= check_period,
            };
            if !due {
                return Ok(());
            }
            *last = Some(now);
        }

        let window = self.current_window(now);
        let mut change = PendingChange::new();
        for node in self.tree.all_in_canonical_order() {
            let rrsigs = node.rrsets.get(Rtype::RRSIG);
            let mut covered_types: Vec<Rtype> = rrsigs
                .records()
                .iter()
                .filter_map(|rr| match &rr.rdata {
                    ZoneRecordData::Rrsig(sig) if needs_refresh(sig, now, self.config.signature_refresh_remaining_fraction) => {
                        Some(sig.type_covered())
                    }
                    _ => None,
                })
                .collect();
            covered_types.sort();
            covered_types.dedup();

            for rtype in covered_types {
                let rrset = node.rrsets.get(rtype);
                if rrset.is_empty() {
                    continue;
                }
                let is_delegation_ns = rtype == Rtype::NS && node.name != self.apex;
                let sigs = sign_rrset(&self.apex, &node.name, &rrset, &self.keys, window, is_delegation_ns)?;
                let replaced = node.rrsets.add_or_update_rrsig(sigs.clone());
                change.deleted.extend(replaced);
                change.added.extend(sigs);
            }
        }

        if change.added.is_empty() && change.deleted.is_empty() {
            return Ok(());
        }

        let outcome = committer::commit(
            &self.tree,
            &self.apex,
            change,
            true,
            &self.keys,
            &self.history,
            window,
            now,
            self.config.history_retention_extra,
            self.internal,
        )?;
        self.after_commit(&outcome);
        Ok(())
    }

    // -- inbound DNS (spec §6) -------------------------------------------

    /// `get-authoritative-response(question)`: the matching RRSet plus its
    /// RRSIGs when DO is set, with an NSEC proof attached for negative NSEC
    /// answers (NSEC3 proofs require the resolver's own hashing of the
    /// query name, left to the query-dispatch collaborator).
    pub fn get_authoritative_response(&self, owner: &StoredName, rtype: Rtype, dnssec_ok: bool) -> AuthoritativeResponse {
        let node = self.tree.find_exact(owner);
        let rrset = node.as_ref().map(|n| n.rrsets.get(rtype)).unwrap_or_default();

        let mut rrsigs = Vec::new();
        if dnssec_ok {
            if let Some(n) = &node {
                rrsigs = n
                    .rrsets
                    .get(Rtype::RRSIG)
                    .records()
                    .iter()
                    .filter(|rr| matches!(&rr.rdata, ZoneRecordData::Rrsig(s) if s.type_covered() == rtype))
                    .cloned()
                    .collect();
            }
        }

        let mut denial_records = Vec::new();
        if dnssec_ok && rrset.is_empty() && self.status() == DnssecStatus::SignedWithNsec {
            let proof_node = node.or_else(|| self.tree.find_previous(owner));
            if let Some(n) = proof_node {
                denial_records.extend(n.rrsets.get(Rtype::NSEC).records().to_vec());
                denial_records.extend(
                    n.rrsets
                        .get(Rtype::RRSIG)
                        .records()
                        .iter()
                        .filter(|rr| matches!(&rr.rdata, ZoneRecordData::Rrsig(s) if s.type_covered() == Rtype::NSEC))
                        .cloned(),
                );
            }
        }

        AuthoritativeResponse {
            rrset,
            rrsigs,
            denial: denial_records,
        }
    }
}

/// Returned by [`ApexZone::get_authoritative_response`].
pub struct AuthoritativeResponse {
    pub rrset: RRSet,
    pub rrsigs: Vec<OwnedRr>,
    pub denial: Vec<OwnedRr>,
}

fn needs_refresh(sig: &domain::rdata::Rrsig<Bytes, StoredName>, now: Timestamp, remaining_fraction: f64) -> bool {
    let inception = sig.inception().into_int() as i64;
    let expiration = sig.expiration().into_int() as i64;
    let now_unix = now.as_second();
    if expiration <= inception {
        return true;
    }
    let total = expiration - inception;
    let remaining = expiration - now_unix;
    (remaining as f64) < (total as f64) * remaining_fraction
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use domain::rdata::{Soa as SoaRdata, A};

    use super::*;
    use crate::interfaces::{NeverObservesDs, NoopPersister};

    fn apex() -> StoredName {
        StoredName::from_str("example.").unwrap()
    }

    struct NoopTransport;
    impl NotifyTransport for NoopTransport {
        fn send_notify<'a>(
            &'a self,
            _target: SocketAddr,
            _apex: &'a StoredName,
            _serial: u32,
        ) -> crate::interfaces::BoxFuture<'a, Result<(), String>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn new_zone() -> Arc<ApexZone> {
        ApexZone::new(
            apex(),
            EngineConfig::default(),
            Arc::new(NoopPersister),
            Arc::new(NeverObservesDs),
            Arc::new(NoopTransport),
        )
    }

    fn install_soa(zone: &ApexZone, serial: u32) {
        let soa = SoaRdata::new(
            apex(),
            apex(),
            domain::base::Serial::from(serial),
            Ttl::from_secs(900),
            Ttl::from_secs(300),
            Ttl::from_secs(604_800),
            Ttl::from_secs(900),
        );
        zone.set_soa(OwnedRr::new(apex(), Class::IN, Ttl::from_secs(900), ZoneRecordData::Soa(soa)))
            .unwrap();
    }

    fn a_rr(owner: &str) -> OwnedRr {
        OwnedRr::new(
            StoredName::from_str(owner).unwrap(),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 1)),
        )
    }

    #[tokio::test]
    async fn sign_zone_produces_dnskey_and_nsec_ring() {
        crate::log::init_test_tracing();
        let zone = new_zone();
        install_soa(&zone, 1);
        zone.add(a_rr("ns1.example.")).unwrap();

        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec,
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();

        assert_eq!(zone.status(), DnssecStatus::SignedWithNsec);
        let apex_node = zone.tree.find_exact(&apex()).unwrap();
        assert_eq!(apex_node.rrsets.get(Rtype::DNSKEY).len(), 2);
        assert!(!apex_node.rrsets.get(Rtype::NSEC).is_empty());

        let ZoneRecordData::Soa(soa) = &apex_node.rrsets.get(Rtype::SOA).records()[0].rdata else {
            unreachable!()
        };
        assert_eq!(soa.serial().into_int(), 2);

        zone.stop_lifecycle_timer();
    }

    #[test]
    fn forbidden_mutation_leaves_state_unchanged() {
        let zone = new_zone();
        install_soa(&zone, 1);

        let err = zone
            .add(OwnedRr::new(
                apex(),
                Class::IN,
                Ttl::from_secs(3600),
                ZoneRecordData::Dnskey(domain::rdata::Dnskey::new(256, 3, domain::base::iana::SecurityAlgorithm::RSASHA256, Bytes::new()).unwrap()),
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation { .. }));

        let apex_node = zone.tree.find_exact(&apex()).unwrap();
        let ZoneRecordData::Soa(soa) = &apex_node.rrsets.get(Rtype::SOA).records()[0].rdata else {
            unreachable!()
        };
        assert_eq!(soa.serial().into_int(), 1);
    }

    #[tokio::test]
    async fn incremental_add_extends_nsec_ring_and_resigns_both_nodes() {
        let zone = new_zone();
        install_soa(&zone, 1);
        zone.add(a_rr("ns1.example.")).unwrap();
        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec,
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();

        zone.add(OwnedRr::new(
            StoredName::from_str("www.example.").unwrap(),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 2)),
        ))
        .unwrap();

        let apex_node = zone.tree.find_exact(&apex()).unwrap();
        let ZoneRecordData::Nsec(apex_nsec) = &apex_node.rrsets.get(Rtype::NSEC).records()[0].rdata else {
            unreachable!()
        };
        assert_eq!(apex_nsec.next_name(), &StoredName::from_str("www.example.").unwrap());

        let www_node = zone.tree.find_exact(&StoredName::from_str("www.example.").unwrap()).unwrap();
        assert!(!www_node.rrsets.get(Rtype::NSEC).is_empty());

        let ZoneRecordData::Soa(soa) = &apex_node.rrsets.get(Rtype::SOA).records()[0].rdata else {
            unreachable!()
        };
        assert_eq!(soa.serial().into_int(), 3);

        zone.stop_lifecycle_timer();
    }

    #[tokio::test]
    async fn rollover_marks_old_zsk_retiring_and_publishes_new_one() {
        let zone = new_zone();
        install_soa(&zone, 1);
        zone.add(a_rr("ns1.example.")).unwrap();
        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec,
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();
        zone.stop_lifecycle_timer();

        let zsk_tag = zone.keys.tags_in_state(KeyKind::Zsk, KeyState::Active)[0];
        let new_tag = zone.rollover(zsk_tag).unwrap();

        assert_ne!(new_tag, zsk_tag);
        assert!(zone.keys.with_key(zsk_tag, |k| k.is_retiring).unwrap());
        assert_eq!(zone.keys.with_key(new_tag, |k| k.state), Some(KeyState::Published));

        let apex_node = zone.tree.find_exact(&apex()).unwrap();
        assert_eq!(apex_node.rrsets.get(Rtype::DNSKEY).len(), 3);
    }

    #[test]
    fn attach_ns_glue_feeds_notify_targets() {
        let zone = new_zone();
        install_soa(&zone, 1);
        let ns_rdata = ZoneRecordData::Ns(domain::rdata::Ns::new(StoredName::from_str("ns1.example.").unwrap()));
        zone.add(OwnedRr::new(apex(), Class::IN, Ttl::from_secs(3600), ns_rdata.clone()))
            .unwrap();

        assert!(zone.ns_glue_addresses().is_empty());

        let glue = vec![OwnedRr::new(
            StoredName::from_str("ns1.example.").unwrap(),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 53)),
        )];
        zone.attach_ns_glue(&apex(), ns_rdata, glue).unwrap();

        assert_eq!(
            zone.ns_glue_addresses(),
            vec!["192.0.2.53:53".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn delete_emptying_one_type_cleans_up_its_rrsig() {
        let zone = new_zone();
        install_soa(&zone, 1);
        let owner = StoredName::from_str("www.example.").unwrap();
        zone.add(a_rr("www.example.")).unwrap();
        zone.add(OwnedRr::new(
            owner.clone(),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::Aaaa(domain::rdata::Aaaa::new(std::net::Ipv6Addr::LOCALHOST)),
        ))
        .unwrap();
        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec,
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();
        zone.stop_lifecycle_timer();

        let covers = |node: &crate::zonetree::ZoneNode, rtype: Rtype| {
            node.rrsets.get(Rtype::RRSIG).records().iter().any(|rr| {
                matches!(&rr.rdata, ZoneRecordData::Rrsig(sig) if sig.type_covered() == rtype)
            })
        };

        let node = zone.tree.find_exact(&owner).unwrap();
        assert!(covers(&node, Rtype::AAAA));
        assert!(covers(&node, Rtype::A));

        zone.delete(&owner, Rtype::AAAA).unwrap();

        let node = zone.tree.find_exact(&owner).unwrap();
        assert!(!covers(&node, Rtype::AAAA));
        assert!(covers(&node, Rtype::A));
    }

    #[tokio::test]
    async fn nsec3_chain_materializes_empty_non_terminals() {
        let zone = new_zone();
        install_soa(&zone, 1);
        zone.add(a_rr("a.b.c.example.")).unwrap();

        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec3 {
                iterations: 1,
                salt: vec![0xab],
            },
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();

        assert_eq!(zone.status(), DnssecStatus::SignedWithNsec3);

        let ents = {
            let guard = zone.nsec3_state.lock().unwrap();
            guard.as_ref().unwrap().ents.clone()
        };
        assert_eq!(ents.len(), 2);
        assert!(ents.contains(&StoredName::from_str("b.c.example.").unwrap()));
        assert!(ents.contains(&StoredName::from_str("c.example.").unwrap()));

        let total_nsec3: usize = zone
            .tree
            .all_in_canonical_order()
            .iter()
            .map(|n| n.rrsets.get(Rtype::NSEC3).len())
            .sum();
        assert_eq!(total_nsec3, 4);

        zone.stop_lifecycle_timer();
    }

    #[tokio::test]
    async fn revoke_flips_bit_and_rekeys_ksk() {
        let zone = new_zone();
        install_soa(&zone, 1);
        zone.add(a_rr("ns1.example.")).unwrap();
        zone.sign_zone(
            KeyAlgorithm::EcdsaP256Sha256,
            DenialKind::Nsec,
            Duration::from_secs(86_400),
            90,
        )
        .unwrap();
        zone.stop_lifecycle_timer();

        let ksk_tag = zone.keys.tags_in_state(KeyKind::Ksk, KeyState::Ready)[0];
        let new_tag = zone.revoke(ksk_tag).unwrap();

        assert_ne!(new_tag, ksk_tag);
        assert!(!zone.keys.contains_tag(ksk_tag));
        assert_eq!(zone.keys.with_key(new_tag, |k| k.state), Some(KeyState::Revoked));
        assert!(zone.keys.with_key(new_tag, |k| k.revoke_bit_set()).unwrap());

        let apex_node = zone.tree.find_exact(&apex()).unwrap();
        assert_eq!(apex_node.rrsets.get(Rtype::DNSKEY).len(), 2);
    }

    #[test]
    fn unsign_before_sign_fails() {
        let zone = new_zone();
        install_soa(&zone, 1);
        assert!(matches!(
            zone.unsign_zone().unwrap_err(),
            EngineError::ZoneNotSigned { .. }
        ));
    }
}
