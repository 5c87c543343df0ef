//! Part of component F: the IXFR change history.
//!
//! A [`ZoneHistory`] accumulates [`HistoryRow`]s in IXFR canonical order
//! (old-SOA, deletes, new-SOA, adds — spec §4.F step 5) across commits, and
//! prunes rows older than the retention bound of spec §3 ("History Row").
//!
//! Grounded on `examples/NLnetLabs-cascade/src/zone/mod.rs`'s `Mutex`-guarded
//! `ZoneState`: one lock guards the whole log, held only for the append/prune
//! operation itself, never across I/O (spec §5, "History lock").

use std::sync::Mutex;
use std::time::Duration;

use jiff::Timestamp;

use crate::rr::OwnedRr;

/// One row of history: a record that was either deleted or added by some
/// commit, stamped with the commit's SOA serial and, for deletions, the
/// deletion time (spec §3, "History Row").
#[derive(Clone, Debug)]
pub struct HistoryRow {
    /// The SOA serial of the commit that produced this row.
    pub serial: u32,
    pub record: OwnedRr,
    /// True for a record removed by this commit, false for one added.
    pub is_deletion: bool,
}

/// One committed batch of history rows, in IXFR order: old-SOA, deletes
/// (including glue/RRSIGs), new-SOA, adds (including glue/RRSIGs).
#[derive(Clone, Debug, Default)]
pub struct HistoryBatch {
    pub serial: u32,
    pub rows: Vec<HistoryRow>,
}

/// The ordered IXFR change log for one zone (spec §4.F, §8 property 7:
/// "applying history rows in order to the zone at its first-ever SOA
/// reconstructs the current zone state").
#[derive(Default)]
pub struct ZoneHistory {
    batches: Mutex<Vec<HistoryBatch>>,
}

impl ZoneHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one commit's worth of history, then prunes anything older
    /// than `retention`. Internal zones never call this (spec §4.F:
    /// "Internal zones ... skip history entirely").
    pub fn append(&self, batch: HistoryBatch, now: Timestamp, retention: Duration) {
        let mut batches = self.batches.lock().unwrap();
        batches.push(batch);
        prune_locked(&mut batches, now, retention);
    }

    /// All batches currently retained, oldest first — the material an IXFR
    /// responder would walk.
    pub fn batches(&self) -> Vec<HistoryBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().unwrap().is_empty()
    }

    /// The oldest serial still retained, if any — the earliest point an
    /// IXFR client could resume from.
    pub fn oldest_serial(&self) -> Option<u32> {
        self.batches.lock().unwrap().first().map(|b| b.serial)
    }
}

/// Retention bound per spec §3: `2 * SOA.expire + largest-TTL-ever-seen`,
/// plus `history_retention_extra` slack from [`crate::config::EngineConfig`].
pub fn retention_bound(soa_expire: u32, largest_ttl_ever_seen: u32, extra: Duration) -> Duration {
    Duration::from_secs(u64::from(soa_expire) * 2 + u64::from(largest_ttl_ever_seen)) + extra
}

fn prune_locked(batches: &mut Vec<HistoryBatch>, now: Timestamp, retention: Duration) {
    let Ok(retention) = jiff::SignedDuration::try_from(retention) else {
        return;
    };
    let cutoff = now.saturating_sub(retention);
    batches.retain(|batch| {
        batch
            .rows
            .iter()
            .filter_map(|row| row.record.info.deleted_at)
            .all(|deleted_at| deleted_at >= cutoff)
    });
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use domain::base::iana::Class;
    use domain::base::Ttl;
    use domain::rdata::{ZoneRecordData, A};

    use super::*;
    use crate::rr::StoredName;

    fn rr(deleted_at: Option<Timestamp>) -> OwnedRr {
        let mut rr = OwnedRr::new(
            StoredName::from_str("www.example.").unwrap(),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::from_octets(192, 0, 2, 1)),
        );
        rr.info.deleted_at = deleted_at;
        rr
    }

    #[test]
    fn append_accumulates_batches_in_order() {
        let history = ZoneHistory::new();
        let now = Timestamp::from_second(1_700_000_000).unwrap();
        history.append(
            HistoryBatch {
                serial: 2,
                rows: vec![],
            },
            now,
            Duration::from_secs(1_000_000),
        );
        history.append(
            HistoryBatch {
                serial: 3,
                rows: vec![],
            },
            now,
            Duration::from_secs(1_000_000),
        );
        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest_serial(), Some(2));
    }

    #[test]
    fn prune_drops_batches_entirely_past_retention() {
        let history = ZoneHistory::new();
        let old_time = Timestamp::from_second(1_000_000_000).unwrap();
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        history.append(
            HistoryBatch {
                serial: 1,
                rows: vec![HistoryRow {
                    serial: 1,
                    record: rr(Some(old_time)),
                    is_deletion: true,
                }],
            },
            old_time,
            Duration::from_secs(1_000_000),
        );
        // A second append, much later, should prune the first batch away.
        history.append(
            HistoryBatch {
                serial: 2,
                rows: vec![HistoryRow {
                    serial: 2,
                    record: rr(Some(now)),
                    is_deletion: true,
                }],
            },
            now,
            Duration::from_secs(1_000_000),
        );
        assert_eq!(history.len(), 1);
        assert_eq!(history.oldest_serial(), Some(2));
    }
}
