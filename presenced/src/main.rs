// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use core_types::{
    Clock, SystemClock,
    config::{AppConfig, ConfigError},
};
use directory::{Directory, DirectoryError, SqliteDirectory};
use engine_api::{Engine, EngineError, FatalHook, FatalNotice};
use log::{error, info, warn};
use metrics::{Metrics, MetricsError};
use presence_engine::{
    IngestPipeline, IngestionConfig, IngestionEngine, PresenceMetrics, SweepConfig, SweepEngine,
    sleep_with_stop,
};
use presence_store::{HistoryLedger, LedgerError, PresenceStore, StoreError};
use sighting_source::{TopicPattern, TopicPatternError, TransportError, WsWorker};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LABEL: &str = "presenced";

fn main() {
    if let Err(err) = run() {
        eprintln!("presenced failed: {err}");
        process::exit(1);
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: presenced [config.toml]")]
    Usage,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to install log subscriber: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Topic(#[from] TopicPatternError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("failed to bind metrics listener: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("failed while waiting for shutdown signal: {0}")]
    ShutdownWait(#[from] mpsc::RecvError),
    #[error("{0}")]
    Fatal(FatalNotice),
}

enum Shutdown {
    Signal,
    Fatal(FatalNotice),
}

fn run() -> Result<(), AppError> {
    init_logging()?;
    let config = {
        let path = parse_config_path()?;
        AppConfig::load(path.as_deref())?
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let db_path = &config.storage.database_path;
    let directory = Arc::new(SqliteDirectory::open(db_path)?);
    let ledger = HistoryLedger::open(db_path)?;
    let store = Arc::new(PresenceStore::new(ledger, config.presence.buffer_window())?);
    let resumed = store.resume(directory.as_ref(), clock.now())?;
    info!(
        "[{LABEL}] storage at {}; resumed {} present entities, buffer window {:?}",
        db_path.display(),
        resumed.restored,
        config.presence.buffer_window()
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let fatal_hook: FatalHook = {
        let tx = shutdown_tx.clone();
        Arc::new(move |notice: FatalNotice| {
            let _ = tx.send(Shutdown::Fatal(notice));
        })
    };
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(Shutdown::Signal);
    })?;

    let counters = PresenceMetrics::new();
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store),
        directory.clone(),
        Arc::clone(&clock),
        counters.clone(),
    ));
    let pattern = TopicPattern::parse(&config.broker.topic_pattern)?;
    let worker = WsWorker::new(
        &config.broker.url,
        &pattern,
        config.broker.retry.to_policy(),
    )?;
    let mut ingest_config = IngestionConfig::new(LABEL, pattern);
    ingest_config.channel_capacity = config.presence.channel_capacity;
    let ingestion = IngestionEngine::new(ingest_config, pipeline, Box::new(worker))
        .with_fatal_hook(Arc::clone(&fatal_hook));
    let sweep = SweepEngine::new(
        SweepConfig {
            label: LABEL.to_string(),
            interval: config.presence.sweep_interval(),
        },
        Arc::clone(&store),
        Arc::clone(&clock),
        counters.clone(),
    )
    .with_fatal_hook(fatal_hook);

    let exporter = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        metrics.register_service_status(ingestion.status_handle());
        metrics.register_service_status(sweep.status_handle());
        metrics.register_service_metrics(Arc::new(counters.clone()));
        Some(MetricsExporter::spawn(metrics, config.metrics.addr)?)
    } else {
        None
    };

    sweep.start()?;
    ingestion.start()?;
    log_engine_health(&sweep);
    log_engine_health(&ingestion);
    info!(
        "[{LABEL}] subscribed via {} to {}; press Ctrl+C to shut down",
        config.broker.url, config.broker.topic_pattern
    );
    let status_logger = StatusLogger::spawn(
        Arc::clone(&store),
        directory.clone(),
        counters,
        config.status_log_interval(),
    );

    let outcome = shutdown_rx.recv()?;
    match &outcome {
        Shutdown::Signal => info!("[{LABEL}] shutdown signal received; stopping engines"),
        Shutdown::Fatal(notice) => error!("[{LABEL}] stopping after fatal error: {notice}"),
    }
    status_logger.shutdown();
    ingestion.stop()?;
    sweep.stop()?;
    if let Some(exporter) = exporter {
        exporter.shutdown();
    }

    match outcome {
        Shutdown::Fatal(notice) => Err(AppError::Fatal(notice)),
        Shutdown::Signal => {
            if config.presence.close_on_shutdown {
                store.close_all(clock.now())?;
            }
            info!("[{LABEL}] stopped cleanly");
            Ok(())
        }
    }
}

fn parse_config_path() -> Result<Option<PathBuf>, AppError> {
    let mut args = env::args().skip(1);
    let path = args.next().map(PathBuf::from);
    if args.next().is_some() {
        return Err(AppError::Usage);
    }
    Ok(path)
}

fn init_logging() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

fn log_engine_health(engine: &dyn Engine) {
    let health = engine.health();
    info!(
        "[{LABEL}] {} status: {:?} ({:?})",
        engine.name(),
        health.status,
        health.detail
    );
}

/// Prometheus endpoint on a dedicated runtime so scrapes never compete with ingestion.
struct MetricsExporter {
    cancel: CancellationToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl MetricsExporter {
    fn spawn(metrics: Arc<Metrics>, addr: SocketAddr) -> Result<Self, AppError> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name("metrics-http".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            error!("[metrics] failed to adopt listener: {err}");
                            return;
                        }
                    };
                    if let Err(err) = metrics.serve(listener, token).await {
                        error!("[metrics] server exited: {err}");
                    }
                });
            })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Periodically logs how many entities each gateway holds and checks the live table against the
/// ledger.
struct StatusLogger {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StatusLogger {
    fn spawn(
        store: Arc<PresenceStore>,
        directory: Arc<dyn Directory>,
        counters: PresenceMetrics,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                sleep_with_stop(&stop_clone, interval);
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                log_presence(&store, directory.as_ref(), &counters);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusLogger {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn log_presence(store: &PresenceStore, directory: &dyn Directory, counters: &PresenceMetrics) {
    let snapshot = store.snapshot();
    let stats = counters.snapshot();
    info!(
        "[status] {} entities present across {} gateways; reports={} sightings={} evictions={} decode_errors={}",
        store.present_count(),
        snapshot.len(),
        stats.reports,
        stats.sightings,
        stats.evictions,
        stats.decode_errors
    );
    for (gateway_id, entries) in &snapshot {
        let name = match directory.gateway(*gateway_id) {
            Ok(Some(gateway)) => gateway.name,
            Ok(None) => format!("gateway #{gateway_id}"),
            Err(err) => {
                warn!("[status] gateway {gateway_id} lookup failed: {err}");
                format!("gateway #{gateway_id}")
            }
        };
        info!("[status]   {name}: {} present", entries.len());
    }
    match store.audit() {
        Ok(mismatches) => {
            for mismatch in mismatches {
                warn!(
                    "[status] live/ledger mismatch for entity {} at gateway {} (live={}, open={})",
                    mismatch.entity_id, mismatch.gateway_id, mismatch.live, mismatch.open_interval
                );
            }
        }
        Err(err) => warn!("[status] audit failed: {err}"),
    }
}
