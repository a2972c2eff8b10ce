use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use core_types::Timestamp;
use core_types::status::{MetricSample, ServiceMetricsReporter};

#[derive(Default)]
struct PresenceMetricsInner {
    frames: AtomicU64,
    reports: AtomicU64,
    decode_errors: AtomicU64,
    unknown_gateways: AtomicU64,
    unknown_beacons: AtomicU64,
    sightings: AtomicU64,
    entries: AtomicU64,
    evictions: AtomicU64,
    consistency_violations: AtomicU64,
    disconnects: AtomicU64,
    sweeps: AtomicU64,
    present_entries: AtomicU64,
    last_report_ms: AtomicI64,
}

/// Shared counters for ingestion and sweeping.
#[derive(Clone)]
pub struct PresenceMetrics {
    inner: Arc<PresenceMetricsInner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceMetricsSnapshot {
    pub frames: u64,
    pub reports: u64,
    pub decode_errors: u64,
    pub unknown_gateways: u64,
    pub unknown_beacons: u64,
    pub sightings: u64,
    pub entries: u64,
    pub evictions: u64,
    pub consistency_violations: u64,
    pub disconnects: u64,
    pub sweeps: u64,
    pub present_entries: u64,
    pub last_report_ms: Option<i64>,
}

impl Default for PresenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceMetrics {
    pub fn new() -> Self {
        let inner = PresenceMetricsInner::default();
        inner.last_report_ms.store(-1, Ordering::Relaxed);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn inc_frames(&self) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_report(&self, at: Timestamp) {
        self.inner.reports.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_report_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self) {
        self.inner.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_gateways(&self) {
        self.inner.unknown_gateways.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_beacons(&self) {
        self.inner.unknown_beacons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sightings(&self) {
        self.inner.sightings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entries(&self) {
        self.inner.entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evictions(&self, delta: u64) {
        if delta > 0 {
            self.inner.evictions.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn inc_consistency_violations(&self, delta: u64) {
        if delta > 0 {
            self.inner
                .consistency_violations
                .fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn inc_disconnects(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sweeps(&self) {
        self.inner.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_present_entries(&self, count: usize) {
        self.inner
            .present_entries
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PresenceMetricsSnapshot {
        let last_report = self.inner.last_report_ms.load(Ordering::Relaxed);
        PresenceMetricsSnapshot {
            frames: self.inner.frames.load(Ordering::Relaxed),
            reports: self.inner.reports.load(Ordering::Relaxed),
            decode_errors: self.inner.decode_errors.load(Ordering::Relaxed),
            unknown_gateways: self.inner.unknown_gateways.load(Ordering::Relaxed),
            unknown_beacons: self.inner.unknown_beacons.load(Ordering::Relaxed),
            sightings: self.inner.sightings.load(Ordering::Relaxed),
            entries: self.inner.entries.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            consistency_violations: self.inner.consistency_violations.load(Ordering::Relaxed),
            disconnects: self.inner.disconnects.load(Ordering::Relaxed),
            sweeps: self.inner.sweeps.load(Ordering::Relaxed),
            present_entries: self.inner.present_entries.load(Ordering::Relaxed),
            last_report_ms: (last_report >= 0).then_some(last_report),
        }
    }
}

impl ServiceMetricsReporter for PresenceMetrics {
    fn service_name(&self) -> &'static str {
        "presence"
    }

    fn collect_metrics(&self) -> Vec<MetricSample> {
        let snap = self.snapshot();
        vec![
            MetricSample::gauge("frames_total", snap.frames as f64),
            MetricSample::gauge("reports_total", snap.reports as f64),
            MetricSample::gauge("decode_errors_total", snap.decode_errors as f64),
            MetricSample::gauge("unknown_gateways_total", snap.unknown_gateways as f64),
            MetricSample::gauge("unknown_beacons_total", snap.unknown_beacons as f64),
            MetricSample::gauge("sightings_total", snap.sightings as f64),
            MetricSample::gauge("entries_total", snap.entries as f64),
            MetricSample::gauge("evictions_total", snap.evictions as f64),
            MetricSample::gauge(
                "consistency_violations_total",
                snap.consistency_violations as f64,
            ),
            MetricSample::gauge("transport_disconnects_total", snap.disconnects as f64),
            MetricSample::gauge("sweeps_total", snap.sweeps as f64),
            MetricSample::gauge("present_entries", snap.present_entries as f64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = PresenceMetrics::new();
        assert_eq!(metrics.snapshot().last_report_ms, None);
        metrics.inc_frames();
        metrics.inc_evictions(0);
        metrics.inc_evictions(2);
        metrics.set_present_entries(4);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames, 1);
        assert_eq!(snap.evictions, 2);
        let samples = metrics.collect_metrics();
        assert!(samples.contains(&MetricSample::gauge("present_entries", 4.0)));
    }
}
