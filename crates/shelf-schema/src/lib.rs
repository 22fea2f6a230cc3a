//! Shelf schema: normalizes the free-text `products.department` column into a
//! `departments` table referenced by `products.department_id`.
//!
//! The normalization is a fixed sequence of steps, each safe to repeat:
//!
//! 1. create the reference table
//! 2. extract the distinct legacy values
//! 3. insert them as reference rows
//! 4. add the reference column to the fact table
//! 5. backfill it by joining on the name
//! 6. add the foreign-key constraint
//! 7. drop the legacy column
//!
//! [`Pipeline`] drives the whole sequence under a [`lock`]; the step
//! functions are public for callers that need finer control, and their proof
//! types (see [`step`]) keep them in order.
//!
//! Only one invocation may run against a database at a time. The pipeline
//! enforces this with a lease row; callers using the step functions directly
//! must coordinate themselves.

pub mod db;
pub mod error;
pub mod foreign_key;
pub mod inspect;
pub mod layout;
pub mod lock;
pub mod materialize;
pub mod pipeline;
pub mod retire;
pub mod step;
pub mod verify;

pub use db::{DEFAULT_BUSY_TIMEOUT, Database, DbConfig};
pub use error::{DbErrorKind, Result, SchemaError};
pub use inspect::{ColumnInfo, ForeignKeyInfo, Inspector, SchemaSnapshot};
pub use layout::{Ident, SchemaLayout};
pub use lock::{DEFAULT_LOCK_TTL, LockGuard, LockInfo};
pub use pipeline::{
    MigrationSummary, Pipeline, PipelineError, PipelineState, PlannedStep, StepReport, StepStatus,
};
pub use step::{BackfillSummary, Outcome, PopulateSummary};
pub use verify::{
    FactSample, Finding, ReferenceCount, ReferenceSample, StructureReport, VerificationReport,
    reference_counts, structure_report, verify,
};
