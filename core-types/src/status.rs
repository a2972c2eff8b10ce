use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Discrete health level exposed by each managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverallStatus {
    Ok,
    #[default]
    Warn,
    Crit,
}

impl OverallStatus {
    pub fn as_gauge(self) -> f64 {
        match self {
            OverallStatus::Ok => 0.0,
            OverallStatus::Warn => 1.0,
            OverallStatus::Crit => 2.0,
        }
    }
}

/// Gauge a service publishes alongside its status (present entries, tracked gateways, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusGauge {
    pub label: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl StatusGauge {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub overall: OverallStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub gauges: Vec<StatusGauge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusSnapshot {
    pub name: String,
    pub overall: OverallStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub gauges: Vec<StatusGauge>,
}

/// Metric sample emitted by a service-specific reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
}

impl MetricSample {
    pub fn gauge(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
        }
    }
}

/// Anything the Prometheus exporter can poll for samples.
pub trait ServiceMetricsReporter: Send + Sync {
    fn service_name(&self) -> &'static str;
    fn collect_metrics(&self) -> Vec<MetricSample>;
}

/// Cloneable handle a worker uses to publish its own health.
#[derive(Clone)]
pub struct ServiceStatusHandle {
    name: &'static str,
    inner: Arc<RwLock<ServiceStatus>>,
}

impl ServiceStatusHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(RwLock::new(ServiceStatus::default())),
        }
    }

    pub fn service_name(&self) -> &'static str {
        self.name
    }

    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut ServiceStatus),
    {
        mutator(&mut self.inner.write());
    }

    pub fn set_overall(&self, status: OverallStatus) {
        self.update(|s| s.overall = status);
    }

    pub fn push_warning(&self, msg: impl Into<String>) {
        self.update(|s| s.warnings.push(msg.into()));
    }

    pub fn clear_warnings_matching(&self, predicate: impl Fn(&str) -> bool) {
        self.update(|s| s.warnings.retain(|w| !predicate(w)));
    }

    /// Replaces any error sharing `prefix` so a flapping condition does not pile up entries.
    pub fn replace_error(&self, prefix: &str, msg: impl Into<String>) {
        let msg = msg.into();
        self.update(|s| {
            s.errors.retain(|e| !e.starts_with(prefix));
            s.errors.push(msg);
        });
    }

    pub fn clear_errors_matching(&self, predicate: impl Fn(&str) -> bool) {
        self.update(|s| s.errors.retain(|e| !predicate(e)));
    }

    pub fn set_gauges(&self, gauges: Vec<StatusGauge>) {
        self.update(|s| s.gauges = gauges);
    }

    pub fn snapshot(&self) -> ServiceStatusSnapshot {
        let guard = self.inner.read();
        ServiceStatusSnapshot {
            name: self.name.to_string(),
            overall: guard.overall,
            warnings: guard.warnings.clone(),
            errors: guard.errors.clone(),
            gauges: guard.gauges.clone(),
        }
    }

    pub fn overall(&self) -> OverallStatus {
        self.inner.read().overall
    }
}

impl ServiceMetricsReporter for ServiceStatusHandle {
    fn service_name(&self) -> &'static str {
        self.name
    }

    fn collect_metrics(&self) -> Vec<MetricSample> {
        let guard = self.inner.read();
        let mut samples = vec![MetricSample::gauge(
            format!("{}_overall", self.name),
            guard.overall.as_gauge(),
        )];
        samples.extend(guard.gauges.iter().map(|g| {
            MetricSample::gauge(format!("{}_{}", self.name, slugify(&g.label)), g.value)
        }));
        samples
    }
}

fn slugify(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_error_keeps_one_entry_per_prefix() {
        let status = ServiceStatusHandle::new("ingestion");
        status.replace_error("broker", "broker: connection refused");
        status.replace_error("broker", "broker: timed out");
        status.replace_error("decode", "decode: bad json");
        let snap = status.snapshot();
        assert_eq!(
            snap.errors,
            vec!["broker: timed out".to_string(), "decode: bad json".to_string()]
        );
    }

    #[test]
    fn gauges_become_slugged_samples() {
        let status = ServiceStatusHandle::new("ingestion");
        status.set_overall(OverallStatus::Crit);
        status.set_gauges(vec![StatusGauge::new("Present Entries", 3.0).with_unit("people")]);
        let samples = status.collect_metrics();
        assert_eq!(samples[0], MetricSample::gauge("ingestion_overall", 2.0));
        assert_eq!(samples[1], MetricSample::gauge("ingestion_present_entries", 3.0));
    }
}
