// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Directory of tracked people and the gateways that sight them.
//!
//! The presence engine only reads from the directory: beacons resolve to people and gateway
//! addresses resolve to gateways. Registration and edits come from the API layer.

mod error;
mod sqlite;

pub use error::DirectoryError;
pub use sqlite::SqliteDirectory;

use core_types::{BeaconId, EntityId, GatewayAddress, GatewayId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: EntityId,
    pub name: String,
    pub sector: String,
    pub beacon: BeaconId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub name: String,
    pub sector: String,
    pub address: GatewayAddress,
}

/// Read side consumed by ingestion and queries.
pub trait Directory: Send + Sync {
    fn person(&self, id: EntityId) -> Result<Option<Person>, DirectoryError>;
    fn person_by_beacon(&self, beacon: &BeaconId) -> Result<Option<Person>, DirectoryError>;
    fn gateway(&self, id: GatewayId) -> Result<Option<Gateway>, DirectoryError>;
    fn gateway_by_address(
        &self,
        address: &GatewayAddress,
    ) -> Result<Option<Gateway>, DirectoryError>;
}
