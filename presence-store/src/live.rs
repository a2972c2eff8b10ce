use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeDelta;
use core_types::{BeaconId, EntityId, GatewayId, Timestamp};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;

/// An entity currently considered present at a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub entity_id: EntityId,
    pub beacon: BeaconId,
    /// Entry time of the open interval backing this entry.
    pub since: Timestamp,
    pub last_seen: Timestamp,
    pub interval_id: i64,
}

/// Presence entries and beacon last-seen times for one gateway.
#[derive(Debug, Default)]
pub struct GatewayShard {
    entries: IndexMap<EntityId, PresenceEntry>,
    last_seen: HashMap<(EntityId, BeaconId), Timestamp>,
}

impl GatewayShard {
    /// Records a sighting of `beacon` on behalf of `entity_id`. Late deliveries never move
    /// last-seen backwards.
    pub fn touch_beacon(
        &mut self,
        entity_id: EntityId,
        beacon: &BeaconId,
        now: Timestamp,
    ) -> Timestamp {
        let seen = self
            .last_seen
            .entry((entity_id, beacon.clone()))
            .or_insert(now);
        if now > *seen {
            *seen = now;
        }
        *seen
    }

    pub fn last_seen(&self, entity_id: EntityId, beacon: &BeaconId) -> Option<Timestamp> {
        self.last_seen.get(&(entity_id, beacon.clone())).copied()
    }

    /// Inserts or refreshes the entry for `entity_id`. Returns true when it was absent.
    pub fn upsert(&mut self, entry: PresenceEntry) -> bool {
        match self.entries.get_mut(&entry.entity_id) {
            Some(existing) => {
                if existing.beacon != entry.beacon {
                    self.last_seen
                        .remove(&(existing.entity_id, existing.beacon.clone()));
                    existing.beacon = entry.beacon;
                }
                existing.since = entry.since;
                existing.interval_id = entry.interval_id;
                if entry.last_seen > existing.last_seen {
                    existing.last_seen = entry.last_seen;
                }
                false
            }
            None => {
                self.entries.insert(entry.entity_id, entry);
                true
            }
        }
    }

    /// Entities not sighted for longer than `window` at `now`. Only the entity's own sightings
    /// count, so a beacon handed to someone else does not keep its former owner present.
    pub fn stale(&self, now: Timestamp, window: TimeDelta) -> Vec<EntityId> {
        self.entries
            .values()
            .filter(|entry| now - entry.last_seen > window)
            .map(|entry| entry.entity_id)
            .collect()
    }

    pub fn remove(&mut self, entity_id: EntityId) -> Option<PresenceEntry> {
        let removed = self.entries.shift_remove(&entity_id)?;
        self.last_seen.remove(&(entity_id, removed.beacon.clone()));
        Some(removed)
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&PresenceEntry> {
        self.entries.get(&entity_id)
    }

    /// Entries in first-sighting order.
    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<PresenceEntry> {
        self.last_seen.clear();
        self.entries.drain(..).map(|(_, entry)| entry).collect()
    }
}

pub type ShardHandle = Arc<RwLock<GatewayShard>>;

/// Gateway-sharded live table. The outer lock only guards shard creation; all per-pair work
/// happens under the shard's own lock so gateways proceed independently.
#[derive(Default)]
pub struct LiveTable {
    shards: RwLock<HashMap<GatewayId, ShardHandle>>,
}

impl LiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard(&self, gateway_id: GatewayId) -> ShardHandle {
        if let Some(shard) = self.shards.read().get(&gateway_id) {
            return Arc::clone(shard);
        }
        Arc::clone(self.shards.write().entry(gateway_id).or_default())
    }

    pub fn existing_shard(&self, gateway_id: GatewayId) -> Option<ShardHandle> {
        self.shards.read().get(&gateway_id).cloned()
    }

    pub fn gateway_ids(&self) -> Vec<GatewayId> {
        let mut ids: Vec<_> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn present_count(&self) -> usize {
        let shards: Vec<ShardHandle> = self.shards.read().values().cloned().collect();
        shards.iter().map(|shard| shard.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(entity_id: EntityId, beacon: &str, seen: i64) -> PresenceEntry {
        PresenceEntry {
            entity_id,
            beacon: BeaconId::new(beacon),
            since: at(0),
            last_seen: at(seen),
            interval_id: entity_id * 100,
        }
    }

    #[test]
    fn upsert_keeps_insertion_order() {
        let mut shard = GatewayShard::default();
        assert!(shard.upsert(entry(3, "C", 0)));
        assert!(shard.upsert(entry(1, "A", 1)));
        assert!(!shard.upsert(entry(3, "C", 2)));
        let order: Vec<_> = shard.entries().map(|e| e.entity_id).collect();
        assert_eq!(order, vec![3, 1]);
        assert_eq!(shard.get(3).unwrap().last_seen, at(2));
    }

    #[test]
    fn stale_is_strictly_older_than_window() {
        let mut shard = GatewayShard::default();
        shard.touch_beacon(1, &BeaconId::new("A"), at(0));
        shard.upsert(entry(1, "A", 0));
        let window = TimeDelta::seconds(5);
        assert!(shard.stale(at(5), window).is_empty());
        assert_eq!(shard.stale(at(6), window), vec![1]);
    }

    #[test]
    fn late_sighting_does_not_rewind_last_seen() {
        let mut shard = GatewayShard::default();
        let beacon = BeaconId::new("A");
        shard.touch_beacon(1, &beacon, at(10));
        assert_eq!(shard.touch_beacon(1, &beacon, at(4)), at(10));
    }

    #[test]
    fn reassigned_beacon_does_not_refresh_former_owner() {
        let mut shard = GatewayShard::default();
        let shared = BeaconId::new("A");
        shard.touch_beacon(1, &shared, at(0));
        shard.upsert(entry(1, "A", 0));
        let seen = shard.touch_beacon(2, &shared, at(30));
        shard.upsert(entry(2, "A", 30));
        assert_eq!(seen, at(30));
        assert_eq!(shard.last_seen(1, &shared), Some(at(0)));
        assert_eq!(shard.stale(at(31), TimeDelta::seconds(5)), vec![1]);
    }

    #[test]
    fn beacon_change_drops_old_index_key() {
        let mut shard = GatewayShard::default();
        shard.touch_beacon(1, &BeaconId::new("A"), at(0));
        shard.upsert(entry(1, "A", 0));
        shard.touch_beacon(1, &BeaconId::new("C"), at(2));
        assert!(!shard.upsert(entry(1, "C", 2)));
        assert_eq!(shard.last_seen(1, &BeaconId::new("A")), None);
        assert_eq!(shard.last_seen(1, &BeaconId::new("C")), Some(at(2)));
        assert_eq!(shard.get(1).unwrap().beacon, BeaconId::new("C"));
    }

    #[test]
    fn shards_are_shared_per_gateway() {
        let table = LiveTable::new();
        table.shard(2).write().upsert(entry(1, "A", 0));
        table.shard(1);
        assert_eq!(table.gateway_ids(), vec![1, 2]);
        assert_eq!(table.present_count(), 1);
        assert!(table.existing_shard(9).is_none());
        let removed = table.shard(2).write().remove(1).unwrap();
        assert_eq!(removed.entity_id, 1);
        assert_eq!(table.present_count(), 0);
    }
}
