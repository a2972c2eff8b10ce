use core_types::{BeaconId, GatewayAddress};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("beacon {0} is already assigned to another person")]
    DuplicateBeacon(BeaconId),
    #[error("gateway address {0} is already registered")]
    DuplicateGateway(GatewayAddress),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("invalid {field}: must not be empty")]
    InvalidInput { field: &'static str },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
