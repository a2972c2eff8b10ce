use directory::DirectoryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored timestamp {millis}ms is out of range")]
    InvalidTimestamp { millis: i64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("buffer window {secs}s is not representable")]
    InvalidWindow { secs: u64 },
}

