//! Shelf ingest: bulk-loads the product catalog from its CSV export.
//!
//! Loading targets the pre-normalization schema, where every product still
//! carries a free-text `department`. Both files are loaded in a single
//! transaction, replacing whatever the tables held before.

pub mod error;
pub mod load;
pub mod records;

pub use error::IngestError;
pub use load::{
    CATALOG_SCHEMA, IngestSummary, LoadReport, ProductSample, Result, Sources, create_schema,
    ingest, ingest_readers, verify_load,
};
pub use records::{DistributionCenterRecord, ProductRecord};
