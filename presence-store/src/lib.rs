//! Live presence table and durable interval history, kept consistent by [`PresenceStore`].
//!
//! - [`LiveTable`]: per-gateway shards of present entities plus the beacon last-seen index.
//! - [`HistoryLedger`]: SQLite-backed entry/exit intervals.
//! - [`PresenceStore`]: the only writer of both, used by ingestion and the sweeper.

pub mod error;
pub mod ledger;
pub mod live;
pub mod store;

pub use error::{LedgerError, StoreError};
pub use ledger::{HistoryInterval, HistoryLedger, IntervalCursor, OpenOutcome};
pub use live::{GatewayShard, LiveTable, PresenceEntry};
pub use store::{EvictionReport, Mismatch, PresenceStore, ResumeReport, SightingOutcome};
