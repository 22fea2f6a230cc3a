//! Error types for catalog ingestion.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading the catalog.
#[derive(Debug, Error)]
pub enum IngestError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV input.
    #[error("CSV error in {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },

    /// Input file is missing.
    #[error("input file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// Statement failed.
    #[error("{step} failed: {source}")]
    Database {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Schema inspection failed.
    #[error(transparent)]
    Schema(#[from] shelf_schema::SchemaError),

    /// The database is not in a state that can be loaded.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl IngestError {
    pub(crate) fn database(step: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database { step, source }
    }

    pub(crate) fn csv(file: &str) -> impl FnOnce(csv::Error) -> Self + '_ {
        move |source| Self::Csv {
            file: file.to_string(),
            source,
        }
    }
}
