// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::sync::Arc;

use core_types::status::{OverallStatus, ServiceStatusHandle, StatusGauge};
use engine_api::{
    Engine, EngineError, EngineHealth, EngineResult, FatalHook, FatalNotice, HealthStatus,
};
use log::{error, info, warn};
use parking_lot::Mutex;
use sighting_source::{SightingSource, SourceEvent, TopicPattern, decode_frame};
use thiserror::Error;
use tokio::{runtime::Runtime, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{IngestPipeline, PipelineError};

const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
const BROKER_ERROR_PREFIX: &str = "broker";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sighting source was already consumed by a previous start")]
    SourceConsumed,
    #[error("failed to build ingestion runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct IngestionConfig {
    pub label: String,
    pub topic_pattern: TopicPattern,
    pub channel_capacity: usize,
}

impl IngestionConfig {
    pub fn new(label: impl Into<String>, topic_pattern: TopicPattern) -> Self {
        Self {
            label: label.into(),
            topic_pattern,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Subscriber worker: pulls frames from a [`SightingSource`] and drives the pipeline, one report
/// at a time.
pub struct IngestionEngine {
    config: IngestionConfig,
    pipeline: Arc<IngestPipeline>,
    source: Mutex<Option<Box<dyn SightingSource>>>,
    status: ServiceStatusHandle,
    fatal: Option<FatalHook>,
    state: Mutex<EngineRuntimeState>,
    health: Arc<Mutex<EngineHealth>>,
}

impl IngestionEngine {
    pub fn new(
        config: IngestionConfig,
        pipeline: Arc<IngestPipeline>,
        source: Box<dyn SightingSource>,
    ) -> Self {
        Self {
            config,
            pipeline,
            source: Mutex::new(Some(source)),
            status: ServiceStatusHandle::new("ingestion"),
            fatal: None,
            state: Mutex::new(EngineRuntimeState::Stopped),
            health: Arc::new(Mutex::new(EngineHealth::default())),
        }
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal = Some(hook);
        self
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.status.clone()
    }

    fn set_health(&self, status: HealthStatus, detail: Option<String>) {
        update_engine_health(&self.health, status, detail);
    }
}

impl Engine for IngestionEngine {
    fn name(&self) -> &'static str {
        "ingestion"
    }

    fn start(&self) -> EngineResult<()> {
        let mut guard = self.state.lock();
        if matches!(*guard, EngineRuntimeState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| EngineError::failure(IngestError::SourceConsumed))?;
        self.set_health(HealthStatus::Starting, None);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("{}-ingest", self.config.label))
            .enable_all()
            .build()
            .map_err(|err| EngineError::failure(IngestError::Runtime(err)))?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let source_label = source.label();
        let source_handle = runtime.spawn(source.run(tx, cancel.clone()));
        let worker = IngestWorker {
            label: self.config.label.clone(),
            pattern: self.config.topic_pattern.clone(),
            pipeline: Arc::clone(&self.pipeline),
            status: self.status.clone(),
            health: Arc::clone(&self.health),
            fatal: self.fatal.clone(),
        };
        let worker_handle = runtime.spawn(worker.run(rx, cancel.clone()));

        *guard = EngineRuntimeState::Running(RuntimeBundle {
            runtime,
            handles: vec![source_handle, worker_handle],
            cancel,
        });
        self.set_health(HealthStatus::Ready, Some(format!("reading from {source_label}")));
        info!("[{}] ingestion engine started", self.config.label);
        Ok(())
    }

    fn stop(&self) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let bundle = match std::mem::replace(&mut *guard, EngineRuntimeState::Stopped) {
            EngineRuntimeState::Running(bundle) => bundle,
            EngineRuntimeState::Stopped => return Err(EngineError::NotRunning),
        };
        bundle.cancel.cancel();
        for handle in bundle.handles {
            if let Err(err) = bundle.runtime.block_on(handle) {
                if !err.is_cancelled() {
                    warn!("[{}] ingestion task error: {err}", self.config.label);
                }
            }
        }
        if !self.health.lock().is_failed() {
            self.set_health(HealthStatus::Stopped, Some("engine stopped".to_string()));
        }
        info!("[{}] ingestion engine stopped", self.config.label);
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        self.health.lock().clone()
    }
}

struct RuntimeBundle {
    runtime: Runtime,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

enum EngineRuntimeState {
    Stopped,
    Running(RuntimeBundle),
}

struct IngestWorker {
    label: String,
    pattern: TopicPattern,
    pipeline: Arc<IngestPipeline>,
    status: ServiceStatusHandle,
    health: Arc<Mutex<EngineHealth>>,
    fatal: Option<FatalHook>,
}

impl IngestWorker {
    async fn run(self, mut rx: mpsc::Receiver<SourceEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else {
                        info!("[{}] sighting source finished", self.label);
                        break;
                    };
                    if let Err(err) = self.on_event(event).await {
                        self.fail(&err.to_string());
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }

    async fn on_event(&self, event: SourceEvent) -> Result<(), PipelineError> {
        let metrics = self.pipeline.metrics();
        match event {
            SourceEvent::Connected => {
                self.status
                    .clear_errors_matching(|e| e.starts_with(BROKER_ERROR_PREFIX));
                self.status.set_overall(OverallStatus::Ok);
                update_engine_health(&self.health, HealthStatus::Ready, None);
            }
            SourceEvent::Disconnected(reason) => {
                metrics.inc_disconnects();
                self.status.replace_error(
                    BROKER_ERROR_PREFIX,
                    format!("{BROKER_ERROR_PREFIX}: {reason}"),
                );
                self.status.set_overall(OverallStatus::Crit);
                update_engine_health(&self.health, HealthStatus::Degraded, Some(reason));
            }
            SourceEvent::Frame(text) => {
                metrics.inc_frames();
                let report = match decode_frame(&self.pattern, &text) {
                    Ok(report) => report,
                    Err(err) => {
                        metrics.inc_decode_errors();
                        error!("[{}] dropping undecodable report: {err}", self.label);
                        return Ok(());
                    }
                };
                let pipeline = Arc::clone(&self.pipeline);
                let joined = tokio::task::spawn_blocking(move || pipeline.handle(&report)).await;
                match joined {
                    Ok(result) => {
                        result?;
                    }
                    Err(err) => {
                        error!("[{}] report handler panicked: {err}", self.label);
                    }
                }
                self.status.set_gauges(vec![
                    StatusGauge::new("present entries", metrics.snapshot().present_entries as f64)
                        .with_unit("entities"),
                ]);
            }
        }
        Ok(())
    }

    fn fail(&self, reason: &str) {
        error!("[{}] ingestion halted on storage failure: {reason}", self.label);
        self.status.replace_error("storage", format!("storage: {reason}"));
        self.status.set_overall(OverallStatus::Crit);
        update_engine_health(&self.health, HealthStatus::Failed, Some(reason.to_string()));
        if let Some(hook) = &self.fatal {
            hook(FatalNotice::new("ingestion", reason));
        }
    }
}

pub(crate) fn update_engine_health(
    health: &Mutex<EngineHealth>,
    status: HealthStatus,
    detail: Option<String>,
) {
    let mut guard = health.lock();
    guard.status = status;
    guard.detail = detail;
}
