// Copyright (c) James Kassemi, SC, US. All rights reserved.
//! Prometheus exporter for the presence daemon. hyper v1.+
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use core_types::status::{
    MetricSample, ServiceMetricsReporter, ServiceStatusHandle, ServiceStatusSnapshot,
};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics listener failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Holds the registered reporters and renders them as Prometheus text on every scrape.
pub struct Metrics {
    registry: Registry,
    service_gauges: GaugeVec,
    last_scrape: Mutex<Option<DateTime<Utc>>>,
    service_statuses: Mutex<Vec<ServiceStatusHandle>>,
    service_metrics: RwLock<Vec<Arc<dyn ServiceMetricsReporter>>>,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let service_gauges = GaugeVec::new(
            Opts::new(
                "service_gauge",
                "Gauges and counters published by presence daemon services",
            ),
            &["service", "metric"],
        )?;
        registry.register(Box::new(service_gauges.clone()))?;
        Ok(Self {
            registry,
            service_gauges,
            last_scrape: Mutex::new(None),
            service_statuses: Mutex::new(Vec::new()),
            service_metrics: RwLock::new(Vec::new()),
        })
    }

    pub fn last_scrape(&self) -> Option<DateTime<Utc>> {
        *self.last_scrape.lock()
    }

    /// Tracks `handle` for status snapshots and exports its overall level and gauges.
    pub fn register_service_status(&self, handle: ServiceStatusHandle) {
        self.service_statuses.lock().push(handle.clone());
        self.register_service_metrics(Arc::new(handle));
    }

    pub fn service_status_snapshots(&self) -> Vec<ServiceStatusSnapshot> {
        self.service_statuses
            .lock()
            .iter()
            .map(|handle| handle.snapshot())
            .collect()
    }

    pub fn register_service_metrics(&self, reporter: Arc<dyn ServiceMetricsReporter>) {
        self.service_metrics.write().push(reporter);
    }

    pub fn collect_service_metrics(&self) {
        let reporters = self.service_metrics.read().clone();
        for reporter in reporters {
            let service = reporter.service_name();
            for sample in reporter.collect_metrics() {
                self.record_metric(service, &sample);
            }
        }
    }

    fn record_metric(&self, service: &str, sample: &MetricSample) {
        self.service_gauges
            .with_label_values(&[service, sample.metric.as_str()])
            .set(sample.value);
    }

    /// Collects every reporter and encodes the registry in the text exposition format.
    pub fn render(&self) -> Result<Vec<u8>, MetricsError> {
        self.collect_service_metrics();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    fn handle_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET || req.uri().path() != METRICS_PATH {
            return plain(StatusCode::NOT_FOUND, "not found");
        }
        *self.last_scrape.lock() = Some(Utc::now());
        match self.render() {
            Ok(body) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                if let Ok(value) = TextEncoder::new().format_type().parse() {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            Err(err) => {
                warn!("[metrics] failed to render scrape: {err}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }

    /// Serves `GET /metrics` until `cancel` fires.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), MetricsError> {
        if let Ok(addr) = listener.local_addr() {
            info!("[metrics] serving on http://{addr}{METRICS_PATH}");
        }
        loop {
            let (socket, _) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(socket);
            let metrics = Arc::clone(self);
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, Infallible>(metrics.handle_request(req)) }
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!("[metrics] connection error: {err}");
                }
            });
        }
        info!("[metrics] server stopped");
        Ok(())
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
