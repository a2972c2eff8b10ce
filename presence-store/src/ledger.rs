// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta};
use core_types::{EntityId, GatewayId, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;

use crate::error::LedgerError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS presence_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    gateway_id INTEGER NOT NULL,
    entry_ms INTEGER NOT NULL,
    exit_ms INTEGER,
    duration_ms INTEGER,
    CHECK (exit_ms IS NULL OR exit_ms >= entry_ms)
);
CREATE UNIQUE INDEX IF NOT EXISTS presence_history_one_open
    ON presence_history (entity_id, gateway_id) WHERE exit_ms IS NULL;
CREATE INDEX IF NOT EXISTS presence_history_by_entity
    ON presence_history (entity_id, entry_ms, id);
";

const COLUMNS: &str = "id, entity_id, gateway_id, entry_ms, exit_ms, duration_ms";

const RANGE_PAGE_SQL: &str = "
SELECT id, entity_id, gateway_id, entry_ms, exit_ms, duration_ms
FROM presence_history
WHERE entity_id = ?1
  AND entry_ms < ?3
  AND (exit_ms IS NULL OR exit_ms > ?2 OR entry_ms >= ?2)
  AND (entry_ms > ?4 OR (entry_ms = ?4 AND id > ?5))
ORDER BY entry_ms, id
LIMIT ?6
";

pub const DEFAULT_PAGE_SIZE: usize = 256;

/// One entry/exit interval of an entity at a gateway. `exit` is `None` while it is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryInterval {
    pub id: i64,
    pub entity_id: EntityId,
    pub gateway_id: GatewayId,
    pub entry: Timestamp,
    pub exit: Option<Timestamp>,
    pub duration_ms: Option<i64>,
}

impl HistoryInterval {
    pub fn is_open(&self) -> bool {
        self.exit.is_none()
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        self.duration_ms.map(TimeDelta::milliseconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(HistoryInterval),
    AlreadyOpen(HistoryInterval),
}

impl OpenOutcome {
    pub fn interval(&self) -> &HistoryInterval {
        match self {
            OpenOutcome::Opened(interval) | OpenOutcome::AlreadyOpen(interval) => interval,
        }
    }
}

struct RawInterval {
    id: i64,
    entity_id: EntityId,
    gateway_id: GatewayId,
    entry_ms: i64,
    exit_ms: Option<i64>,
    duration_ms: Option<i64>,
}

impl RawInterval {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            gateway_id: row.get(2)?,
            entry_ms: row.get(3)?,
            exit_ms: row.get(4)?,
            duration_ms: row.get(5)?,
        })
    }
}

impl TryFrom<RawInterval> for HistoryInterval {
    type Error = LedgerError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Ok(Self {
            id: raw.id,
            entity_id: raw.entity_id,
            gateway_id: raw.gateway_id,
            entry: from_millis(raw.entry_ms)?,
            exit: raw.exit_ms.map(from_millis).transpose()?,
            duration_ms: raw.duration_ms,
        })
    }
}

fn from_millis(millis: i64) -> Result<Timestamp, LedgerError> {
    DateTime::from_timestamp_millis(millis).ok_or(LedgerError::InvalidTimestamp { millis })
}

/// Durable entry/exit intervals per (entity, gateway) pair.
///
/// At most one interval per pair is open at a time; a partial unique index backs this up in the
/// database. Closed intervals are never rewritten or deleted here.
pub struct HistoryLedger {
    conn: Mutex<Connection>,
    page_size: usize,
}

impl HistoryLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Holds the connection so several writes commit while the caller keeps its own lock.
    pub fn lock(&self) -> LedgerGuard<'_> {
        LedgerGuard {
            conn: self.conn.lock(),
        }
    }

    pub fn open_or_touch(
        &self,
        entity_id: EntityId,
        gateway_id: GatewayId,
        now: Timestamp,
    ) -> Result<OpenOutcome, LedgerError> {
        self.lock().open_or_touch(entity_id, gateway_id, now)
    }

    pub fn close_open(
        &self,
        entity_id: EntityId,
        gateway_id: GatewayId,
        now: Timestamp,
    ) -> Result<Option<HistoryInterval>, LedgerError> {
        self.lock().close_open(entity_id, gateway_id, now)
    }

    /// Intervals of `entity_id` overlapping `[from, to)`, entry ascending, fetched page by page.
    pub fn query_range(
        &self,
        entity_id: EntityId,
        from: Timestamp,
        to: Timestamp,
    ) -> IntervalCursor<'_> {
        IntervalCursor {
            ledger: self,
            entity_id,
            from_ms: from.timestamp_millis(),
            to_ms: to.timestamp_millis(),
            after: (i64::MIN, i64::MIN),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn open_intervals(&self) -> Result<Vec<HistoryInterval>, LedgerError> {
        self.lock().open_intervals()
    }
}

pub struct LedgerGuard<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl LedgerGuard<'_> {
    /// Returns the open interval for the pair, opening one at `now` when none exists.
    ///
    /// A new entry never precedes the pair's latest exit, so intervals cannot overlap even if the
    /// clock steps backwards.
    pub fn open_or_touch(
        &mut self,
        entity_id: EntityId,
        gateway_id: GatewayId,
        now: Timestamp,
    ) -> Result<OpenOutcome, LedgerError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(raw) = select_open(&tx, entity_id, gateway_id)? {
            tx.commit()?;
            return Ok(OpenOutcome::AlreadyOpen(HistoryInterval::try_from(raw)?));
        }
        let last_exit: Option<i64> = tx.query_row(
            "SELECT MAX(exit_ms) FROM presence_history WHERE entity_id = ?1 AND gateway_id = ?2",
            params![entity_id, gateway_id],
            |row| row.get(0),
        )?;
        let entry_ms = last_exit.map_or(now.timestamp_millis(), |exit| {
            exit.max(now.timestamp_millis())
        });
        tx.execute(
            "INSERT INTO presence_history (entity_id, gateway_id, entry_ms) VALUES (?1, ?2, ?3)",
            params![entity_id, gateway_id, entry_ms],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(OpenOutcome::Opened(HistoryInterval {
            id,
            entity_id,
            gateway_id,
            entry: from_millis(entry_ms)?,
            exit: None,
            duration_ms: None,
        }))
    }

    /// Closes the pair's open interval at `now` (never before its entry). `None` when nothing
    /// was open, which makes a repeated close harmless.
    pub fn close_open(
        &mut self,
        entity_id: EntityId,
        gateway_id: GatewayId,
        now: Timestamp,
    ) -> Result<Option<HistoryInterval>, LedgerError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(raw) = select_open(&tx, entity_id, gateway_id)? else {
            tx.commit()?;
            return Ok(None);
        };
        let exit_ms = now.timestamp_millis().max(raw.entry_ms);
        let duration_ms = exit_ms - raw.entry_ms;
        tx.execute(
            "UPDATE presence_history SET exit_ms = ?1, duration_ms = ?2
             WHERE id = ?3 AND exit_ms IS NULL",
            params![exit_ms, duration_ms, raw.id],
        )?;
        tx.commit()?;
        let closed = RawInterval {
            exit_ms: Some(exit_ms),
            duration_ms: Some(duration_ms),
            ..raw
        };
        Ok(Some(HistoryInterval::try_from(closed)?))
    }

    pub fn open_intervals(&mut self) -> Result<Vec<HistoryInterval>, LedgerError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM presence_history WHERE exit_ms IS NULL
             ORDER BY gateway_id, entry_ms, id"
        ))?;
        let rows = stmt.query_map([], RawInterval::from_row)?;
        let mut intervals = Vec::new();
        for raw in rows {
            intervals.push(HistoryInterval::try_from(raw?)?);
        }
        Ok(intervals)
    }

    pub fn open_interval(
        &mut self,
        entity_id: EntityId,
        gateway_id: GatewayId,
    ) -> Result<Option<HistoryInterval>, LedgerError> {
        select_open(&self.conn, entity_id, gateway_id)?
            .map(HistoryInterval::try_from)
            .transpose()
    }
}

fn select_open(
    conn: &Connection,
    entity_id: EntityId,
    gateway_id: GatewayId,
) -> rusqlite::Result<Option<RawInterval>> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM presence_history
             WHERE entity_id = ?1 AND gateway_id = ?2 AND exit_ms IS NULL"
        ),
        params![entity_id, gateway_id],
        RawInterval::from_row,
    )
    .optional()
}

/// Lazy, keyset-paged walk over a range query. The ledger lock is only held while a page loads.
pub struct IntervalCursor<'a> {
    ledger: &'a HistoryLedger,
    entity_id: EntityId,
    from_ms: i64,
    to_ms: i64,
    after: (i64, i64),
    page: VecDeque<HistoryInterval>,
    exhausted: bool,
}

impl IntervalCursor<'_> {
    fn fetch_page(&mut self) -> Result<(), LedgerError> {
        let ledger = self.ledger;
        let conn = ledger.conn.lock();
        let mut stmt = conn.prepare_cached(RANGE_PAGE_SQL)?;
        let rows = stmt.query_map(
            params![
                self.entity_id,
                self.from_ms,
                self.to_ms,
                self.after.0,
                self.after.1,
                ledger.page_size as i64
            ],
            RawInterval::from_row,
        )?;
        let mut fetched = 0;
        for raw in rows {
            let raw = raw?;
            self.after = (raw.entry_ms, raw.id);
            self.page.push_back(HistoryInterval::try_from(raw)?);
            fetched += 1;
        }
        if fetched < ledger.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for IntervalCursor<'_> {
    type Item = Result<HistoryInterval, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn open_is_idempotent_per_pair() {
        let ledger = HistoryLedger::open_in_memory().unwrap();
        let first = ledger.open_or_touch(1, 10, at(0)).unwrap();
        assert!(matches!(first, OpenOutcome::Opened(_)));
        let again = ledger.open_or_touch(1, 10, at(3)).unwrap();
        assert_eq!(again, OpenOutcome::AlreadyOpen(first.interval().clone()));
        assert_eq!(again.interval().entry, at(0));
        // another gateway gets its own interval
        assert!(matches!(
            ledger.open_or_touch(1, 11, at(3)).unwrap(),
            OpenOutcome::Opened(_)
        ));
        assert_eq!(ledger.open_intervals().unwrap().len(), 2);
    }

    #[test]
    fn close_sets_exit_and_duration_once() {
        let ledger = HistoryLedger::open_in_memory().unwrap();
        ledger.open_or_touch(1, 10, at(0)).unwrap();
        let closed = ledger.close_open(1, 10, at(9)).unwrap().unwrap();
        assert_eq!(closed.exit, Some(at(9)));
        assert_eq!(closed.duration(), Some(TimeDelta::seconds(9)));
        assert!(ledger.close_open(1, 10, at(12)).unwrap().is_none());
        let all: Vec<_> = ledger
            .query_range(1, at(0), at(100))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all, vec![closed]);
    }

    #[test]
    fn clock_regression_cannot_overlap_intervals() {
        let ledger = HistoryLedger::open_in_memory().unwrap();
        ledger.open_or_touch(1, 10, at(10)).unwrap();
        // close before entry clamps to a zero-length interval
        let closed = ledger.close_open(1, 10, at(5)).unwrap().unwrap();
        assert_eq!(closed.exit, Some(at(10)));
        assert_eq!(closed.duration_ms, Some(0));
        let reopened = ledger.open_or_touch(1, 10, at(2)).unwrap();
        assert_eq!(reopened.interval().entry, at(10));
    }

    #[test]
    fn range_query_pages_and_filters_overlap() {
        let ledger = HistoryLedger::open_in_memory().unwrap().with_page_size(2);
        for start in [0, 20, 40, 60, 80] {
            ledger.open_or_touch(7, 1, at(start)).unwrap();
            ledger.close_open(7, 1, at(start + 10)).unwrap();
        }
        ledger.open_or_touch(7, 2, at(90)).unwrap();
        ledger.open_or_touch(8, 1, at(25)).unwrap();

        let entries: Vec<_> = ledger
            .query_range(7, at(25), at(1_000))
            .map(|res| res.unwrap().entry)
            .collect();
        assert_eq!(entries, vec![at(20), at(40), at(60), at(80), at(90)]);

        let none: Vec<_> = ledger.query_range(7, at(11), at(20)).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn interval_ending_at_range_start_is_excluded() {
        let ledger = HistoryLedger::open_in_memory().unwrap();
        ledger.open_or_touch(1, 10, at(0)).unwrap();
        ledger.close_open(1, 10, at(10)).unwrap();
        assert_eq!(ledger.query_range(1, at(10), at(20)).count(), 0);
        assert_eq!(ledger.query_range(1, at(9), at(20)).count(), 1);

        // a zero-length visit at the range start still counts
        ledger.open_or_touch(1, 11, at(10)).unwrap();
        ledger.close_open(1, 11, at(10)).unwrap();
        let hits: Vec<_> = ledger
            .query_range(1, at(10), at(20))
            .map(|res| res.unwrap().gateway_id)
            .collect();
        assert_eq!(hits, vec![11]);
    }

    #[test]
    fn reopening_file_keeps_open_intervals() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("presence.db");
        {
            let ledger = HistoryLedger::open(&path).unwrap();
            ledger.open_or_touch(3, 4, at(1)).unwrap();
        }
        let ledger = HistoryLedger::open(&path).unwrap();
        let open = ledger.open_intervals().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!((open[0].entity_id, open[0].gateway_id), (3, 4));
        assert!(open[0].is_open());
    }
}
