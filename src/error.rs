//! Application error types

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Stale data: {0}")]
    Staleness(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Whether the error is a transient storage failure worth retrying.
    ///
    /// SQLite reports write contention as `DatabaseBusy` / `DatabaseLocked`;
    /// a pool timeout means every connection is momentarily checked out.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Pool(_) => true,
            AppError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let busy = AppError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let validation = AppError::Validation("negative price".into());
        assert!(!validation.is_transient());

        let not_found = AppError::Database(rusqlite::Error::QueryReturnedNoRows);
        assert!(!not_found.is_transient());
    }
}
