// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::sync::Arc;

use core_types::{Clock, GatewayId, SightingReport};
use directory::{Directory, DirectoryError};
use log::{debug, warn};
use presence_store::{PresenceStore, SightingOutcome, StoreError};
use thiserror::Error;

use crate::metrics::PresenceMetrics;

/// Storage failures. Anything returned here is fatal to the ingestion worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("presence store failed: {0}")]
    Store(#[from] StoreError),
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleSummary {
    pub gateway_id: Option<GatewayId>,
    pub sightings: usize,
    pub entered: usize,
    pub unknown_beacons: usize,
    pub evicted: usize,
}

/// Applies decoded reports to the presence store.
pub struct IngestPipeline {
    store: Arc<PresenceStore>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    metrics: PresenceMetrics,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<PresenceStore>,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
        metrics: PresenceMetrics,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            metrics,
        }
    }

    pub fn metrics(&self) -> &PresenceMetrics {
        &self.metrics
    }

    /// Records every tracked beacon in `report`, then sweeps the reporting gateway.
    ///
    /// Unknown gateways and beacons are skipped with a warning.
    pub fn handle(&self, report: &SightingReport) -> Result<HandleSummary, PipelineError> {
        let now = self.clock.now();
        self.metrics.mark_report(now);
        let mut summary = HandleSummary::default();

        let Some(gateway) = self.directory.gateway_by_address(&report.gateway)? else {
            warn!(
                "[ingest] report from unregistered gateway {} ignored",
                report.gateway
            );
            self.metrics.inc_unknown_gateways();
            return Ok(summary);
        };
        summary.gateway_id = Some(gateway.id);

        for observation in report.tracked() {
            let Some(person) = self.directory.person_by_beacon(&observation.beacon)? else {
                warn!(
                    "[ingest] unknown beacon {} at gateway {}",
                    observation.beacon, gateway.address
                );
                self.metrics.inc_unknown_beacons();
                summary.unknown_beacons += 1;
                continue;
            };
            let outcome =
                self.store
                    .record_sighting(gateway.id, person.id, &observation.beacon, now)?;
            self.metrics.inc_sightings();
            summary.sightings += 1;
            match outcome {
                SightingOutcome::Entered => {
                    self.metrics.inc_entries();
                    summary.entered += 1;
                }
                SightingOutcome::Repaired => self.metrics.inc_consistency_violations(1),
                SightingOutcome::Refreshed => {}
            }
        }

        let eviction = self.store.evict_stale(gateway.id, now)?;
        self.metrics.inc_evictions(eviction.evicted() as u64);
        self.metrics
            .inc_consistency_violations(eviction.orphaned as u64);
        self.metrics.set_present_entries(self.store.present_count());
        summary.evicted = eviction.evicted();
        debug!(
            "[ingest] gateway {}: {} sightings, {} evicted",
            gateway.id, summary.sightings, summary.evicted
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use core_types::{BeaconId, BeaconKind, GatewayAddress, ManualClock, Observation};
    use directory::SqliteDirectory;
    use presence_store::HistoryLedger;
    use std::time::Duration;

    struct Fixture {
        pipeline: IngestPipeline,
        store: Arc<PresenceStore>,
        clock: Arc<ManualClock>,
        directory: Arc<SqliteDirectory>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(SqliteDirectory::open_in_memory().unwrap());
        directory
            .register_gateway("Lobby", "north", &GatewayAddress::new("GW1"))
            .unwrap();
        directory
            .register_person("Alice", "north", &BeaconId::new("AA:01"))
            .unwrap();
        let store = Arc::new(
            PresenceStore::new(
                HistoryLedger::open_in_memory().unwrap(),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            directory.clone(),
            clock.clone(),
            PresenceMetrics::new(),
        );
        Fixture {
            pipeline,
            store,
            clock,
            directory,
        }
    }

    fn ibeacon(mac: &str) -> Observation {
        Observation {
            kind: BeaconKind::IBeacon,
            beacon: BeaconId::new(mac),
            rssi: Some(-60),
        }
    }

    #[test]
    fn unknown_gateway_is_skipped() {
        let fx = fixture();
        let report = SightingReport::new(GatewayAddress::new("NOPE"), vec![ibeacon("AA:01")]);
        let summary = fx.pipeline.handle(&report).unwrap();
        assert_eq!(summary.gateway_id, None);
        assert_eq!(fx.store.present_count(), 0);
        assert_eq!(fx.pipeline.metrics().snapshot().unknown_gateways, 1);
    }

    #[test]
    fn non_ibeacon_kinds_are_ignored() {
        let fx = fixture();
        let report = SightingReport::new(
            GatewayAddress::new("GW1"),
            vec![Observation {
                kind: BeaconKind::Other("Eddystone".into()),
                beacon: BeaconId::new("AA:01"),
                rssi: None,
            }],
        );
        let summary = fx.pipeline.handle(&report).unwrap();
        assert_eq!(summary.sightings, 0);
        assert_eq!(fx.store.present_count(), 0);
    }

    #[test]
    fn inline_sweep_only_touches_reporting_gateway() {
        let fx = fixture();
        let gw2 = fx
            .directory
            .register_gateway("Dock", "south", &GatewayAddress::new("GW2"))
            .unwrap();
        fx.pipeline
            .handle(&SightingReport::new(
                GatewayAddress::new("GW2"),
                vec![ibeacon("AA:01")],
            ))
            .unwrap();
        fx.clock.advance(ChronoDuration::seconds(30));
        let summary = fx
            .pipeline
            .handle(&SightingReport::new(GatewayAddress::new("GW1"), vec![]))
            .unwrap();
        assert_eq!(summary.evicted, 0);
        assert_eq!(fx.store.list_by_gateway(gw2.id).len(), 1);
        let summary = fx
            .pipeline
            .handle(&SightingReport::new(GatewayAddress::new("GW2"), vec![]))
            .unwrap();
        assert_eq!(summary.evicted, 1);
        assert_eq!(fx.pipeline.metrics().snapshot().evictions, 1);
    }
}
