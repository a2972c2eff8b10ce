// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::fmt;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Lifecycle shared by the long-running presence workers.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self) -> EngineResult<()>;
    fn stop(&self) -> EngineResult<()>;
    fn health(&self) -> EngineHealth;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub detail: Option<String>,
}

impl EngineHealth {
    pub fn new(status: HealthStatus, detail: Option<String>) -> Self {
        Self { status, detail }
    }

    pub fn is_failed(&self) -> bool {
        self.status == HealthStatus::Failed
    }
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Stopped,
            detail: None,
        }
    }
}

/// Sent to the supervisor when a worker hits an error it cannot recover from.
#[derive(Clone, Debug)]
pub struct FatalNotice {
    pub engine: &'static str,
    pub reason: String,
}

impl FatalNotice {
    pub fn new(engine: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            engine,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for FatalNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.engine, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error("engine encountered an error: {source}")]
    Failure {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    pub fn failure(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngineError::Failure {
            source: Box::new(source),
        }
    }
}

/// Callback a worker invokes to hand a [`FatalNotice`] to its supervisor.
pub type FatalHook = std::sync::Arc<dyn Fn(FatalNotice) + Send + Sync>;
