// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use chrono::TimeDelta;
use core_types::{BeaconId, EntityId, GatewayId, Timestamp};
use directory::Directory;
use log::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::ledger::{HistoryInterval, HistoryLedger, IntervalCursor, OpenOutcome};
use crate::live::{LiveTable, PresenceEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingOutcome {
    /// First sighting: a live entry and an interval were created.
    Entered,
    /// Repeat sighting inside the buffer window.
    Refreshed,
    /// A live entry existed without an open interval; a new interval was opened for it.
    Repaired,
}

#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub closed: Vec<HistoryInterval>,
    /// Live entries removed without a matching open interval.
    pub orphaned: usize,
}

impl EvictionReport {
    pub fn evicted(&self) -> usize {
        self.closed.len() + self.orphaned
    }

    fn merge(&mut self, other: EvictionReport) {
        self.closed.extend(other.closed);
        self.orphaned += other.orphaned;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub restored: usize,
    pub closed_unknown: usize,
}

/// A pair whose live entry and open interval disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub gateway_id: GatewayId,
    pub entity_id: EntityId,
    pub live: bool,
    pub open_interval: bool,
}

impl Mismatch {
    fn live_only(gateway_id: GatewayId, entity_id: EntityId) -> Self {
        Self {
            gateway_id,
            entity_id,
            live: true,
            open_interval: false,
        }
    }

    fn ledger_only(gateway_id: GatewayId, entity_id: EntityId) -> Self {
        Self {
            gateway_id,
            entity_id,
            live: false,
            open_interval: true,
        }
    }
}

/// Keeps the live table and the history ledger consistent with each other.
///
/// Every mutation of a (gateway, entity) pair takes the gateway's shard lock, then the ledger
/// lock, commits the ledger change and updates the shard before either lock is released. Readers
/// of the live table therefore never see an entry without its open interval.
pub struct PresenceStore {
    live: LiveTable,
    ledger: HistoryLedger,
    window: TimeDelta,
}

impl PresenceStore {
    pub fn new(ledger: HistoryLedger, buffer_window: Duration) -> Result<Self> {
        let window = TimeDelta::from_std(buffer_window).map_err(|_| StoreError::InvalidWindow {
            secs: buffer_window.as_secs(),
        })?;
        Ok(Self {
            live: LiveTable::new(),
            ledger,
            window,
        })
    }

    pub fn buffer_window(&self) -> TimeDelta {
        self.window
    }

    /// Every interval the ledger still holds open, across all gateways.
    pub fn open_intervals(&self) -> Result<Vec<HistoryInterval>> {
        Ok(self.ledger.open_intervals()?)
    }

    pub fn record_sighting(
        &self,
        gateway_id: GatewayId,
        entity_id: EntityId,
        beacon: &BeaconId,
        now: Timestamp,
    ) -> Result<SightingOutcome> {
        let shard = self.live.shard(gateway_id);
        let mut shard = shard.write();
        let mut ledger = self.ledger.lock();

        let outcome = ledger.open_or_touch(entity_id, gateway_id, now)?;
        let last_seen = shard.touch_beacon(entity_id, beacon, now);
        let had_entry = shard.get(entity_id).is_some();
        let interval = outcome.interval();
        shard.upsert(PresenceEntry {
            entity_id,
            beacon: beacon.clone(),
            since: interval.entry,
            last_seen,
            interval_id: interval.id,
        });

        Ok(match (had_entry, &outcome) {
            (false, _) => {
                if let OpenOutcome::AlreadyOpen(existing) = &outcome {
                    debug!(
                        "[presence] entity {entity_id} re-entered gateway {gateway_id} onto open interval {}",
                        existing.id
                    );
                }
                info!("[presence] entity {entity_id} entered gateway {gateway_id}");
                SightingOutcome::Entered
            }
            (true, OpenOutcome::AlreadyOpen(_)) => SightingOutcome::Refreshed,
            (true, OpenOutcome::Opened(opened)) => {
                warn!(
                    "[presence] entity {entity_id} at gateway {gateway_id} had no open interval; opened {}",
                    opened.id
                );
                SightingOutcome::Repaired
            }
        })
    }

    /// Evicts entries at `gateway_id` silent for longer than the buffer window and closes their
    /// intervals at `now`.
    pub fn evict_stale(&self, gateway_id: GatewayId, now: Timestamp) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        let Some(shard) = self.live.existing_shard(gateway_id) else {
            return Ok(report);
        };
        let mut shard = shard.write();
        let stale = shard.stale(now, self.window);
        if stale.is_empty() {
            return Ok(report);
        }
        let mut ledger = self.ledger.lock();
        for entity_id in stale {
            match ledger.close_open(entity_id, gateway_id, now)? {
                Some(closed) => {
                    info!(
                        "[presence] entity {entity_id} left gateway {gateway_id} after {}ms",
                        closed.duration_ms.unwrap_or_default()
                    );
                    report.closed.push(closed);
                }
                None => {
                    warn!(
                        "[presence] evicting entity {entity_id} at gateway {gateway_id} with no open interval"
                    );
                    report.orphaned += 1;
                }
            }
            shard.remove(entity_id);
        }
        Ok(report)
    }

    /// Timer-driven pass over every gateway, including ones that stopped reporting.
    pub fn sweep_all(&self, now: Timestamp) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        for gateway_id in self.live.gateway_ids() {
            report.merge(self.evict_stale(gateway_id, now)?);
        }
        Ok(report)
    }

    pub fn list_by_gateway(&self, gateway_id: GatewayId) -> Vec<PresenceEntry> {
        self.live
            .existing_shard(gateway_id)
            .map(|shard| shard.read().entries().cloned().collect())
            .unwrap_or_default()
    }

    /// Point-in-time copy of every non-empty gateway. Each gateway is copied under its own read
    /// lock.
    pub fn snapshot(&self) -> BTreeMap<GatewayId, Vec<PresenceEntry>> {
        self.live
            .gateway_ids()
            .into_iter()
            .filter_map(|gateway_id| {
                let entries = self.list_by_gateway(gateway_id);
                (!entries.is_empty()).then_some((gateway_id, entries))
            })
            .collect()
    }

    pub fn present_count(&self) -> usize {
        self.live.present_count()
    }

    pub fn history(&self, entity_id: EntityId, from: Timestamp, to: Timestamp) -> IntervalCursor<'_> {
        self.ledger.query_range(entity_id, from, to)
    }

    /// Rebuilds the live table from intervals left open by the previous run. Restored entries
    /// count as seen at `now`, so they are closed one buffer window later unless re-sighted.
    pub fn resume(&self, directory: &dyn Directory, now: Timestamp) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();
        for interval in self.ledger.open_intervals()? {
            let shard = self.live.shard(interval.gateway_id);
            let mut shard = shard.write();
            match directory.person(interval.entity_id)? {
                Some(person) => {
                    let last_seen = shard.touch_beacon(interval.entity_id, &person.beacon, now);
                    shard.upsert(PresenceEntry {
                        entity_id: interval.entity_id,
                        beacon: person.beacon,
                        since: interval.entry,
                        last_seen,
                        interval_id: interval.id,
                    });
                    report.restored += 1;
                }
                None => {
                    warn!(
                        "[presence] closing interval {} of deleted entity {}",
                        interval.id, interval.entity_id
                    );
                    self.ledger
                        .lock()
                        .close_open(interval.entity_id, interval.gateway_id, now)?;
                    report.closed_unknown += 1;
                }
            }
        }
        if report.restored > 0 || report.closed_unknown > 0 {
            info!(
                "[presence] resumed {} open intervals, closed {} for deleted entities",
                report.restored, report.closed_unknown
            );
        }
        Ok(report)
    }

    /// Closes every live entry at `now`, then any interval still open in the ledger.
    pub fn close_all(&self, now: Timestamp) -> Result<usize> {
        let mut closed = 0;
        for gateway_id in self.live.gateway_ids() {
            let Some(shard) = self.live.existing_shard(gateway_id) else {
                continue;
            };
            let mut shard = shard.write();
            let mut ledger = self.ledger.lock();
            for entry in shard.drain() {
                if ledger.close_open(entry.entity_id, gateway_id, now)?.is_some() {
                    closed += 1;
                }
            }
        }
        for interval in self.ledger.open_intervals()? {
            let shard = self.live.shard(interval.gateway_id);
            let _shard = shard.write();
            if self
                .ledger
                .lock()
                .close_open(interval.entity_id, interval.gateway_id, now)?
                .is_some()
            {
                closed += 1;
            }
        }
        info!("[presence] closed {closed} open intervals");
        Ok(closed)
    }

    /// Compares the live table against the ledger. Open intervals are read in one pass; only the
    /// pairs that disagree with a shard are rechecked under that shard's lock.
    pub fn audit(&self) -> Result<Vec<Mismatch>> {
        let mut open: BTreeMap<GatewayId, HashSet<EntityId>> = BTreeMap::new();
        for interval in self.ledger.open_intervals()? {
            open.entry(interval.gateway_id)
                .or_default()
                .insert(interval.entity_id);
        }
        let mut gateway_ids: BTreeSet<GatewayId> = open.keys().copied().collect();
        gateway_ids.extend(self.live.gateway_ids());

        let no_intervals = HashSet::new();
        let mut mismatches = Vec::new();
        for gateway_id in gateway_ids {
            let expected = open.get(&gateway_id).unwrap_or(&no_intervals);
            match self.live.existing_shard(gateway_id) {
                Some(shard) => {
                    let shard = shard.read();
                    let live_only: Vec<EntityId> = shard
                        .entries()
                        .map(|entry| entry.entity_id)
                        .filter(|entity_id| !expected.contains(entity_id))
                        .collect();
                    let ledger_only: Vec<EntityId> = expected
                        .iter()
                        .copied()
                        .filter(|entity_id| shard.get(*entity_id).is_none())
                        .collect();
                    if live_only.is_empty() && ledger_only.is_empty() {
                        continue;
                    }
                    let mut ledger = self.ledger.lock();
                    for entity_id in live_only {
                        if ledger.open_interval(entity_id, gateway_id)?.is_none() {
                            mismatches.push(Mismatch::live_only(gateway_id, entity_id));
                        }
                    }
                    for entity_id in ledger_only {
                        if ledger.open_interval(entity_id, gateway_id)?.is_some() {
                            mismatches.push(Mismatch::ledger_only(gateway_id, entity_id));
                        }
                    }
                }
                None => {
                    let mut ledger = self.ledger.lock();
                    // a sighting may have created the shard since the scan
                    if self.live.existing_shard(gateway_id).is_some() {
                        continue;
                    }
                    for &entity_id in expected {
                        if ledger.open_interval(entity_id, gateway_id)?.is_some() {
                            mismatches.push(Mismatch::ledger_only(gateway_id, entity_id));
                        }
                    }
                }
            }
        }
        mismatches.sort_by_key(|m| (m.gateway_id, m.entity_id));
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use directory::SqliteDirectory;
    use std::sync::Arc;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> PresenceStore {
        PresenceStore::new(
            HistoryLedger::open_in_memory().unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// Closes an interval directly in the ledger, leaving the live entry behind.
    fn close_behind_live_table(store: &PresenceStore, entity_id: EntityId, gateway_id: GatewayId) {
        store
            .ledger
            .close_open(entity_id, gateway_id, at(1))
            .unwrap();
    }

    #[test]
    fn repeat_sighting_keeps_one_interval_until_timeout() {
        let store = store();
        let beacon = BeaconId::new("AA");
        assert_eq!(
            store.record_sighting(1, 7, &beacon, at(0)).unwrap(),
            SightingOutcome::Entered
        );
        assert_eq!(
            store.record_sighting(1, 7, &beacon, at(3)).unwrap(),
            SightingOutcome::Refreshed
        );
        let entries = store.list_by_gateway(1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_seen, at(3));
        assert_eq!(entries[0].since, at(0));

        // t+5 is still inside the window
        assert_eq!(store.evict_stale(1, at(8)).unwrap().evicted(), 0);
        let report = store.evict_stale(1, at(9)).unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].exit, Some(at(9)));
        assert_eq!(report.closed[0].duration(), Some(TimeDelta::seconds(9)));
        assert!(store.list_by_gateway(1).is_empty());
        assert!(store.audit().unwrap().is_empty());
    }

    #[test]
    fn replayed_reports_are_idempotent() {
        let store = store();
        let beacon = BeaconId::new("AA");
        for _ in 0..5 {
            store.record_sighting(1, 7, &beacon, at(1)).unwrap();
        }
        assert_eq!(store.list_by_gateway(1).len(), 1);
        assert_eq!(store.open_intervals().unwrap().len(), 1);
    }

    #[test]
    fn sweep_all_reaches_silent_gateways() {
        let store = store();
        store.record_sighting(1, 7, &BeaconId::new("AA"), at(0)).unwrap();
        store.record_sighting(2, 8, &BeaconId::new("BB"), at(4)).unwrap();
        let report = store.sweep_all(at(6)).unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].gateway_id, 1);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn externally_closed_interval_is_repaired() {
        let store = store();
        let beacon = BeaconId::new("AA");
        store.record_sighting(1, 7, &beacon, at(0)).unwrap();
        close_behind_live_table(&store, 7, 1);
        assert_eq!(store.audit().unwrap().len(), 1);
        assert_eq!(
            store.record_sighting(1, 7, &beacon, at(2)).unwrap(),
            SightingOutcome::Repaired
        );
        assert!(store.audit().unwrap().is_empty());
        assert_eq!(store.list_by_gateway(1)[0].since, at(2));
    }

    #[test]
    fn audit_reports_open_interval_without_live_entry() {
        let store = store();
        store.record_sighting(1, 7, &BeaconId::new("AA"), at(0)).unwrap();
        store.ledger.open_or_touch(8, 1, at(0)).unwrap();
        store.ledger.open_or_touch(9, 4, at(0)).unwrap();
        assert_eq!(
            store.audit().unwrap(),
            vec![
                Mismatch {
                    gateway_id: 1,
                    entity_id: 8,
                    live: false,
                    open_interval: true,
                },
                Mismatch {
                    gateway_id: 4,
                    entity_id: 9,
                    live: false,
                    open_interval: true,
                },
            ]
        );
        assert_eq!(store.open_intervals().unwrap().len(), 3);
    }

    #[test]
    fn eviction_without_interval_is_counted_not_fatal() {
        let store = store();
        store.record_sighting(1, 7, &BeaconId::new("AA"), at(0)).unwrap();
        close_behind_live_table(&store, 7, 1);
        let report = store.evict_stale(1, at(10)).unwrap();
        assert_eq!(report.orphaned, 1);
        assert!(report.closed.is_empty());
        assert!(store.list_by_gateway(1).is_empty());
    }

    #[test]
    fn resume_restores_open_intervals_and_drops_deleted_people() {
        let directory = SqliteDirectory::open_in_memory().unwrap();
        let alice = directory
            .register_person("Alice", "a", &BeaconId::new("AA"))
            .unwrap();
        let bob = directory
            .register_person("Bob", "b", &BeaconId::new("BB"))
            .unwrap();
        let ledger = HistoryLedger::open_in_memory().unwrap();
        ledger.open_or_touch(alice.id, 1, at(0)).unwrap();
        ledger.open_or_touch(bob.id, 1, at(0)).unwrap();
        directory.delete_person(bob.id).unwrap();

        let store = PresenceStore::new(ledger, Duration::from_secs(5)).unwrap();
        let report = store.resume(&directory, at(100)).unwrap();
        assert_eq!(
            report,
            ResumeReport {
                restored: 1,
                closed_unknown: 1
            }
        );
        let entries = store.list_by_gateway(1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].since, at(0));
        assert_eq!(entries[0].last_seen, at(100));
        assert!(store.evict_stale(1, at(105)).unwrap().closed.is_empty());
        assert_eq!(store.evict_stale(1, at(106)).unwrap().closed.len(), 1);
    }

    #[test]
    fn close_all_leaves_nothing_open() {
        let store = store();
        store.record_sighting(1, 7, &BeaconId::new("AA"), at(0)).unwrap();
        store.record_sighting(2, 7, &BeaconId::new("AA"), at(0)).unwrap();
        store.ledger.open_or_touch(9, 3, at(0)).unwrap();
        assert_eq!(store.close_all(at(2)).unwrap(), 3);
        assert!(store.open_intervals().unwrap().is_empty());
        assert_eq!(store.present_count(), 0);
    }

    #[test]
    fn concurrent_ingest_and_sweep_hold_the_invariant() {
        let store = Arc::new(store());
        let beacons: Vec<_> = (0..8).map(|i| BeaconId::new(&format!("B{i}"))).collect();
        let mut handles = Vec::new();
        for gateway_id in 1..=3 {
            let store = Arc::clone(&store);
            let beacons = beacons.clone();
            handles.push(std::thread::spawn(move || {
                for step in 0..200 {
                    let idx = (step * 7 + gateway_id as usize) % beacons.len();
                    store
                        .record_sighting(gateway_id, idx as EntityId, &beacons[idx], at(step as i64))
                        .unwrap();
                }
            }));
        }
        {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for step in 0..200 {
                    store.sweep_all(at(step)).unwrap();
                    assert!(store.audit().unwrap().is_empty());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.audit().unwrap().is_empty());
        for (gateway_id, entries) in store.snapshot() {
            for entry in entries {
                let mut ledger = store.ledger.lock();
                let open = ledger.open_interval(entry.entity_id, gateway_id).unwrap();
                assert_eq!(open.map(|i| i.id), Some(entry.interval_id));
            }
        }
    }
}
