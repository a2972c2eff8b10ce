// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Presence ingestion and sweeping engines plus the read-only query surface.

mod ingest;
mod metrics;
mod pipeline;
mod query;
mod sweep;

pub use ingest::{IngestError, IngestionConfig, IngestionEngine};
pub use metrics::{PresenceMetrics, PresenceMetricsSnapshot};
pub use pipeline::{HandleSummary, IngestPipeline, PipelineError};
pub use query::{GatewayPresence, HistoryView, PresenceQuery, PresenceView, QueryError};
pub use sweep::{SweepConfig, SweepEngine, sleep_with_stop};
