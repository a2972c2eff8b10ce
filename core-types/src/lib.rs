// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shared identifiers, sighting types, configuration, and runtime helpers for the presence
//! tracking services.

pub mod clock;
pub mod config;
pub mod retry;
pub mod status;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use types::{
    BeaconId, BeaconKind, EntityId, GatewayAddress, GatewayId, Observation, SightingReport,
    Timestamp,
};
