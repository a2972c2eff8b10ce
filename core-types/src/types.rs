// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wall-clock instant used for every presence timestamp.
pub type Timestamp = DateTime<Utc>;

/// Directory row id of a tracked person.
pub type EntityId = i64;

/// Directory row id of a fixed gateway.
pub type GatewayId = i64;

/// Canonical form of a hardware address: separators dropped, ASCII upper-cased.
///
/// Gateways report `ac233fa24d3b` while operators tend to type `AC:23:3F:A2:4D:3B`; both map to
/// the same key.
fn normalize_hw_address(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|ch| !matches!(ch, ':' | '-' | '.' | ' '))
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// Identifier broadcast by a beacon carried by a person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BeaconId(String);

impl BeaconId {
    pub fn new(raw: &str) -> Self {
        Self(normalize_hw_address(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for BeaconId {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<BeaconId> for String {
    fn from(value: BeaconId) -> Self {
        value.0
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address a gateway publishes under (its MAC).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct GatewayAddress(String);

impl GatewayAddress {
    pub fn new(raw: &str) -> Self {
        Self(normalize_hw_address(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for GatewayAddress {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<GatewayAddress> for String {
    fn from(value: GatewayAddress) -> Self {
        value.0
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertisement family of an observed beacon. Only `IBeacon` is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconKind {
    IBeacon,
    Other(String),
}

impl BeaconKind {
    pub fn from_wire(kind: &str) -> Self {
        if kind.eq_ignore_ascii_case("ibeacon") {
            BeaconKind::IBeacon
        } else {
            BeaconKind::Other(kind.to_string())
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, BeaconKind::IBeacon)
    }
}

/// One beacon heard by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: BeaconKind,
    pub beacon: BeaconId,
    pub rssi: Option<i32>,
}

/// Decoded report: every beacon a gateway currently hears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SightingReport {
    pub gateway: GatewayAddress,
    pub observations: Vec<Observation>,
}

impl SightingReport {
    pub fn new(gateway: GatewayAddress, observations: Vec<Observation>) -> Self {
        Self {
            gateway,
            observations,
        }
    }

    /// Observations of tracked kind with a usable beacon id.
    pub fn tracked(&self) -> impl Iterator<Item = &Observation> {
        self.observations
            .iter()
            .filter(|obs| obs.kind.is_tracked() && !obs.beacon.is_empty())
    }
}
