//! Error types for schema normalization.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, ffi};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = SchemaError> = std::result::Result<T, E>;

/// Classification of a database failure, derived from SQLite's structured
/// result codes rather than message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// The target is already in the requested state (duplicate unique value).
    AlreadyExists,
    /// The addressed row or object does not exist.
    NotFound,
    /// A foreign-key, not-null or check constraint rejected the change.
    IntegrityViolation,
    /// The database could not be opened, read, or was held by another writer.
    Connectivity,
    /// Anything else.
    Other,
}

impl DbErrorKind {
    /// Classify a rusqlite error.
    pub fn classify(err: &rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => match failure.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        Self::AlreadyExists
                    }
                    _ => Self::IntegrityViolation,
                },
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied => Self::Connectivity,
                ErrorCode::NotFound => Self::NotFound,
                _ => Self::Other,
            },
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            _ => Self::Other,
        }
    }

    /// Whether this failure means the change was already in place.
    pub fn is_benign(self) -> bool {
        matches!(self, Self::AlreadyExists)
    }
}

/// Errors that can occur while inspecting or normalizing the schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A table or column name failed validation.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Schema metadata could not be read.
    #[error("failed to read schema metadata for {element}: {source}")]
    Lookup {
        element: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The database is not in a shape the pipeline can start from.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Backfilled references do not all resolve.
    #[error(
        "{orphaned} row(s) reference missing {reference_table} rows (first row ids: {sample_ids:?})"
    )]
    Integrity {
        reference_table: String,
        orphaned: u64,
        sample_ids: Vec<i64>,
    },

    /// A statement failed for a reason that is not "already applied".
    #[error("{step} failed ({kind:?}): {source}")]
    Database {
        step: &'static str,
        kind: DbErrorKind,
        #[source]
        source: rusqlite::Error,
    },

    /// Another invocation holds the migration lock.
    #[error("migration lock {name} is held by {holder} until {expires_at}")]
    LockHeld {
        name: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// The requested lease is too long to express as an expiry time.
    #[error("lock ttl {0:?} is out of range")]
    InvalidLockTtl(Duration),

    /// Post-migration checks found problems.
    #[error("verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),
}

impl SchemaError {
    /// Build a mapper that wraps a rusqlite error with the failing step.
    pub(crate) fn database(step: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database {
            step,
            kind: DbErrorKind::classify(&source),
            source,
        }
    }

    /// Build a mapper for metadata lookups.
    pub(crate) fn lookup(element: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let element = element.into();
        move |source| Self::Lookup { element, source }
    }

    /// The database error classification, if this error came from a statement.
    pub fn kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Lookup { source, .. } => Some(DbErrorKind::classify(source)),
            _ => None,
        }
    }
}
