use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use core_types::Clock;
use core_types::status::{OverallStatus, ServiceStatusHandle, StatusGauge};
use engine_api::{
    Engine, EngineError, EngineHealth, EngineResult, FatalHook, FatalNotice, HealthStatus,
};
use log::{error, info};
use parking_lot::Mutex;
use presence_store::{PresenceStore, StoreError};

use crate::ingest::update_engine_health;
use crate::metrics::PresenceMetrics;

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SweepConfig {
    pub label: String,
    pub interval: Duration,
}

/// Timer-driven global sweep. Catches gateways that went silent, which the inline sweep never
/// revisits.
pub struct SweepEngine {
    inner: Arc<SweepInner>,
}

impl SweepEngine {
    pub fn new(
        config: SweepConfig,
        store: Arc<PresenceStore>,
        clock: Arc<dyn Clock>,
        metrics: PresenceMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(SweepInner {
                config,
                store,
                clock,
                metrics,
                status: ServiceStatusHandle::new("sweep"),
                fatal: Mutex::new(None),
                state: Mutex::new(EngineRuntimeState::Stopped),
                health: Mutex::new(EngineHealth::default()),
            }),
        }
    }

    pub fn with_fatal_hook(self, hook: FatalHook) -> Self {
        *self.inner.fatal.lock() = Some(hook);
        self
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.inner.status.clone()
    }

    /// One pass at the clock's current time, outside the timer.
    pub fn sweep_now(&self) -> Result<usize, StoreError> {
        self.inner.sweep_once()
    }
}

impl Engine for SweepEngine {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn start(&self) -> EngineResult<()> {
        SweepInner::start(&self.inner)
    }

    fn stop(&self) -> EngineResult<()> {
        self.inner.stop()
    }

    fn health(&self) -> EngineHealth {
        self.inner.health.lock().clone()
    }
}

struct SweepInner {
    config: SweepConfig,
    store: Arc<PresenceStore>,
    clock: Arc<dyn Clock>,
    metrics: PresenceMetrics,
    status: ServiceStatusHandle,
    fatal: Mutex<Option<FatalHook>>,
    state: Mutex<EngineRuntimeState>,
    health: Mutex<EngineHealth>,
}

struct ThreadBundle {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

enum EngineRuntimeState {
    Stopped,
    Running(ThreadBundle),
}

impl SweepInner {
    fn start(this: &Arc<Self>) -> EngineResult<()> {
        let mut guard = this.state.lock();
        if matches!(*guard, EngineRuntimeState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }
        update_engine_health(&this.health, HealthStatus::Starting, None);
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = Arc::clone(this);
        let cancel_clone = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("{}-sweep", this.config.label))
            .spawn(move || runner.run(cancel_clone))
            .map_err(EngineError::failure)?;
        info!(
            "[{}] sweep engine starting, every {:?}",
            this.config.label, this.config.interval
        );
        *guard = EngineRuntimeState::Running(ThreadBundle { cancel, handle });
        Ok(())
    }

    fn stop(&self) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let bundle = match std::mem::replace(&mut *guard, EngineRuntimeState::Stopped) {
            EngineRuntimeState::Running(bundle) => bundle,
            EngineRuntimeState::Stopped => return Err(EngineError::NotRunning),
        };
        bundle.cancel.store(true, Ordering::Relaxed);
        if let Err(err) = bundle.handle.join() {
            error!("[{}] sweep join error: {:?}", self.config.label, err);
        }
        if !self.health.lock().is_failed() {
            update_engine_health(&self.health, HealthStatus::Stopped, None);
        }
        Ok(())
    }

    fn run(self: Arc<Self>, cancel: Arc<AtomicBool>) {
        update_engine_health(&self.health, HealthStatus::Ready, None);
        self.status.set_overall(OverallStatus::Ok);
        while !cancel.load(Ordering::Relaxed) {
            sleep_with_stop(&cancel, self.config.interval);
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if let Err(err) = self.sweep_once() {
                error!("[{}] sweep failed: {err}", self.config.label);
                self.status.replace_error("storage", format!("storage: {err}"));
                self.status.set_overall(OverallStatus::Crit);
                update_engine_health(&self.health, HealthStatus::Failed, Some(err.to_string()));
                if let Some(hook) = self.fatal.lock().clone() {
                    hook(FatalNotice::new("sweep", &err));
                }
                return;
            }
        }
        update_engine_health(&self.health, HealthStatus::Stopped, None);
        info!("[{}] sweep engine stopped", self.config.label);
    }

    fn sweep_once(&self) -> Result<usize, StoreError> {
        let report = self.store.sweep_all(self.clock.now())?;
        let evicted = report.evicted();
        self.metrics.inc_sweeps();
        self.metrics.inc_evictions(evicted as u64);
        self.metrics
            .inc_consistency_violations(report.orphaned as u64);
        let present = self.store.present_count();
        self.metrics.set_present_entries(present);
        self.status.set_gauges(vec![
            StatusGauge::new("present entries", present as f64).with_unit("entities"),
        ]);
        if evicted > 0 {
            info!("[{}] sweep evicted {evicted} stale entries", self.config.label);
        }
        Ok(evicted)
    }
}

/// Sleeps for `interval` in short slices so a stop request is noticed quickly.
pub fn sleep_with_stop(stop: &AtomicBool, interval: Duration) {
    let mut remaining = interval;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let step = remaining.min(STOP_POLL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
