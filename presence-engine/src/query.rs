use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use core_types::{EntityId, GatewayAddress, GatewayId, Timestamp};
use directory::{Directory, DirectoryError, Gateway, Person};
use presence_store::{LedgerError, PresenceEntry, PresenceStore};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("gateway {0} is not registered")]
    UnknownGateway(GatewayAddress),
    #[error("date range {from}..={to} is reversed")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("history read failed: {0}")]
    Ledger(#[from] LedgerError),
}

/// One entity present at a gateway, joined with its directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub entity_id: EntityId,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub since: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayPresence {
    pub gateway_id: GatewayId,
    pub gateway_name: Option<String>,
    pub address: Option<GatewayAddress>,
    pub present: Vec<PresenceView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryView {
    pub gateway_id: GatewayId,
    pub gateway_name: Option<String>,
    pub entry: Timestamp,
    pub exit: Option<Timestamp>,
    pub duration_ms: Option<i64>,
}

/// Read-only accessors for the API layer. Nothing here mutates presence state.
#[derive(Clone)]
pub struct PresenceQuery {
    store: Arc<PresenceStore>,
    directory: Arc<dyn Directory>,
}

impl PresenceQuery {
    pub fn new(store: Arc<PresenceStore>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Entities at the gateway with `address`, in order of arrival.
    pub fn presence_at(&self, address: &GatewayAddress) -> Result<Vec<PresenceView>, QueryError> {
        let gateway = self
            .directory
            .gateway_by_address(address)?
            .ok_or_else(|| QueryError::UnknownGateway(address.clone()))?;
        let entries = self.store.list_by_gateway(gateway.id);
        self.views(&entries)
    }

    pub fn full_snapshot(&self) -> Result<Vec<GatewayPresence>, QueryError> {
        let mut out = Vec::new();
        for (gateway_id, entries) in self.store.snapshot() {
            let gateway = self.directory.gateway(gateway_id)?;
            out.push(GatewayPresence {
                gateway_id,
                gateway_name: gateway.as_ref().map(|g| g.name.clone()),
                address: gateway.map(|g| g.address),
                present: self.views(&entries)?,
            });
        }
        Ok(out)
    }

    /// Intervals of `entity_id` overlapping the UTC days `from..=to`, oldest entry first. The open
    /// interval, if any, comes back with `exit: None`.
    pub fn history_for(
        &self,
        entity_id: EntityId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoryView>, QueryError> {
        if to < from {
            return Err(QueryError::InvalidRange { from, to });
        }
        let start = from.and_time(NaiveTime::MIN).and_utc();
        let end = to.and_time(NaiveTime::MIN).and_utc() + TimeDelta::days(1);
        let mut names: HashMap<GatewayId, Option<Gateway>> = HashMap::new();
        let mut out = Vec::new();
        for interval in self.store.history(entity_id, start, end) {
            let interval = interval?;
            let gateway = match names.get(&interval.gateway_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.directory.gateway(interval.gateway_id)?;
                    names.insert(interval.gateway_id, fetched.clone());
                    fetched
                }
            };
            out.push(HistoryView {
                gateway_id: interval.gateway_id,
                gateway_name: gateway.map(|g| g.name),
                entry: interval.entry,
                exit: interval.exit,
                duration_ms: interval.duration_ms,
            });
        }
        Ok(out)
    }

    fn views(&self, entries: &[PresenceEntry]) -> Result<Vec<PresenceView>, QueryError> {
        entries
            .iter()
            .map(|entry| {
                let person: Option<Person> = self.directory.person(entry.entity_id)?;
                Ok(PresenceView {
                    entity_id: entry.entity_id,
                    name: person.as_ref().map(|p| p.name.clone()),
                    sector: person.map(|p| p.sector),
                    since: entry.since,
                    last_seen: entry.last_seen,
                })
            })
            .collect()
    }
}
