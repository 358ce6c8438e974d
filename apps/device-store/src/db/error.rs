//! Database error types.

use std::path::PathBuf;

use survey_core::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration to schema version {version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: i32, supported: i32 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("connection lock poisoned")]
    LockPoisoned,
}
