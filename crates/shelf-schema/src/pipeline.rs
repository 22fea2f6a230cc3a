//! The normalization as a resumable state machine.
//!
//! ```text
//! Start -> TableCreated -> ValuesExtracted -> TablePopulated -> ColumnAdded
//!       -> Backfilled -> Constrained -> LegacyDropped -> Complete
//! ```
//!
//! Each step commits on its own and detects when its target state already
//! exists, so a run that died halfway resumes by simply running again. A
//! failing step stops the run and reports the last state that was reached;
//! nothing already applied is rolled back.

use std::fmt;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tracing::{error, info};

use crate::error::{Result, SchemaError};
use crate::foreign_key::{add_constraint, add_reference_column, backfill, pending_backfill};
use crate::inspect::Inspector;
use crate::layout::SchemaLayout;
use crate::lock::{self, DEFAULT_LOCK_TTL};
use crate::materialize::{ensure_reference_table, extract_distinct, populate};
use crate::retire::drop_legacy_column;
use crate::step::{BackfillSummary, Outcome, PopulateSummary};
use crate::verify::{VerificationReport, verify};

/// Position in the normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Start,
    TableCreated,
    ValuesExtracted,
    TablePopulated,
    ColumnAdded,
    Backfilled,
    Constrained,
    LegacyDropped,
    Complete,
    Failed,
}

impl PipelineState {
    /// The mutating steps, in order.
    pub const STEPS: [PipelineState; 7] = [
        Self::TableCreated,
        Self::ValuesExtracted,
        Self::TablePopulated,
        Self::ColumnAdded,
        Self::Backfilled,
        Self::Constrained,
        Self::LegacyDropped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Start => "start",
            Self::TableCreated => "reference table created",
            Self::ValuesExtracted => "values extracted",
            Self::TablePopulated => "reference table populated",
            Self::ColumnAdded => "reference column added",
            Self::Backfilled => "reference column backfilled",
            Self::Constrained => "foreign key constrained",
            Self::LegacyDropped => "legacy column dropped",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A run that stopped on a non-benign error.
#[derive(Debug, Error)]
#[error("migration stopped after '{reached}': {source}")]
pub struct PipelineError {
    /// Last state successfully reached; the database is left there.
    pub reached: PipelineState,
    #[source]
    pub source: SchemaError,
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub state: PipelineState,
    pub outcome: Outcome,
    pub detail: String,
}

/// Result of a complete run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub steps: Vec<StepReport>,
    pub extracted: usize,
    pub populate: PopulateSummary,
    pub backfill: BackfillSummary,
    pub report: VerificationReport,
}

/// Whether a step still has work to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Done,
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub state: PipelineState,
    pub status: StepStatus,
    pub detail: String,
}

type Progress<'c> = Box<dyn FnMut(&StepReport) + 'c>;

/// Drives the normalization over one connection.
pub struct Pipeline<'c> {
    conn: &'c Connection,
    layout: SchemaLayout,
    lock_ttl: Duration,
    state: PipelineState,
    steps: Vec<StepReport>,
    progress: Option<Progress<'c>>,
}

impl<'c> Pipeline<'c> {
    pub fn new(conn: &'c Connection, layout: SchemaLayout) -> Self {
        Self {
            conn,
            layout,
            lock_ttl: DEFAULT_LOCK_TTL,
            state: PipelineState::Start,
            steps: Vec::new(),
            progress: None,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Call `progress` after every completed step.
    pub fn on_progress(mut self, progress: impl FnMut(&StepReport) + 'c) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn layout(&self) -> &SchemaLayout {
        &self.layout
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run every step in order.
    pub fn run(&mut self) -> Result<MigrationSummary, PipelineError> {
        info!(
            fact_table = %self.layout.fact_table,
            legacy_column = %self.layout.legacy_column,
            reference_table = %self.layout.reference_table,
            "starting normalization"
        );
        self.state = PipelineState::Start;
        self.steps.clear();

        match self.execute() {
            Ok(summary) => {
                self.state = PipelineState::Complete;
                info!(
                    reference_rows = summary.report.reference_rows.unwrap_or_default(),
                    referenced_fact_rows = summary.report.referenced_fact_rows,
                    "normalization complete"
                );
                Ok(summary)
            }
            Err(source) => {
                let reached = self.state;
                self.state = PipelineState::Failed;
                error!(reached = %reached, error = %source, "normalization failed");
                Err(PipelineError { reached, source })
            }
        }
    }

    fn execute(&mut self) -> Result<MigrationSummary> {
        let conn = self.conn;
        let layout = self.layout.clone();
        let inspector = Inspector::new(conn);

        check_preconditions(conn, &layout)?;
        let _lock = lock::acquire(conn, &layout.lock_name(), self.lock_ttl)?;

        let table = ensure_reference_table(conn, &layout)?;
        self.record(
            PipelineState::TableCreated,
            table.outcome(),
            format!("table {}", layout.reference_table),
        );

        let source_present = inspector.column_exists(&layout.fact_table, &layout.legacy_column)?;
        let values = extract_distinct(conn, &layout.fact_table, &layout.legacy_column)?;
        self.record(
            PipelineState::ValuesExtracted,
            Outcome::from_changed(source_present),
            if source_present {
                format!(
                    "{} distinct value(s) in {}.{}",
                    values.len(),
                    layout.fact_table,
                    layout.legacy_column
                )
            } else {
                format!("{}.{} already retired", layout.fact_table, layout.legacy_column)
            },
        );

        let populated = populate(conn, &layout, &table, &values)?;
        let populate_summary = populated.summary();
        self.record(
            PipelineState::TablePopulated,
            populated.outcome(),
            format!(
                "{} inserted, {} already present",
                populate_summary.inserted, populate_summary.skipped
            ),
        );

        let column = add_reference_column(conn, &layout, &table)?;
        self.record(
            PipelineState::ColumnAdded,
            column.outcome(),
            format!("column {}.{}", layout.fact_table, layout.reference_column),
        );

        let backfilled = backfill(conn, &layout, &populated, &column)?;
        let backfill_summary = backfilled.summary();
        self.record(
            PipelineState::Backfilled,
            backfilled.outcome(),
            format!(
                "{} row(s) assigned, {} stale reference(s) cleared",
                backfill_summary.assigned, backfill_summary.cleared
            ),
        );

        let constrained = add_constraint(conn, &layout, &backfilled)?;
        self.record(
            PipelineState::Constrained,
            constrained.outcome(),
            format!("constraint {}", layout.constraint_name),
        );

        let dropped = drop_legacy_column(conn, &layout, &constrained)?;
        self.record(
            PipelineState::LegacyDropped,
            dropped,
            format!("column {}.{}", layout.fact_table, layout.legacy_column),
        );

        let report = verify(conn, &layout)?;
        let findings = report.findings();
        if !findings.is_empty() {
            return Err(SchemaError::Verification(
                findings.iter().map(ToString::to_string).collect(),
            ));
        }

        Ok(MigrationSummary {
            steps: self.steps.clone(),
            extracted: values.len(),
            populate: populate_summary,
            backfill: backfill_summary,
            report,
        })
    }

    fn record(&mut self, state: PipelineState, outcome: Outcome, detail: String) {
        self.state = state;
        match outcome {
            Outcome::Applied => info!(step = %state, %detail, "step applied"),
            Outcome::AlreadyApplied => info!(step = %state, %detail, "step already applied"),
        }
        let report = StepReport {
            state,
            outcome,
            detail,
        };
        if let Some(progress) = self.progress.as_mut() {
            progress(&report);
        }
        self.steps.push(report);
    }

    /// Report which steps a run would still perform, without changing
    /// anything.
    pub fn plan(&self) -> Result<Vec<PlannedStep>> {
        let conn = self.conn;
        let layout = &self.layout;
        check_preconditions(conn, layout)?;

        let snapshot = Inspector::new(conn).snapshot(layout)?;
        let report = verify(conn, layout)?;
        let pending_rows = pending_backfill(conn, layout)?;
        let values_pending = report.pending_legacy_values > 0;

        let status = |done: bool| {
            if done {
                StepStatus::Done
            } else {
                StepStatus::Pending
            }
        };
        let planned = |state, done, detail: String| PlannedStep {
            state,
            status: status(done),
            detail,
        };

        Ok(vec![
            planned(
                PipelineState::TableCreated,
                snapshot.reference_table,
                format!("table {}", layout.reference_table),
            ),
            planned(
                PipelineState::ValuesExtracted,
                !values_pending,
                format!("{} distinct legacy value(s)", report.legacy_values.unwrap_or_default()),
            ),
            planned(
                PipelineState::TablePopulated,
                !values_pending,
                format!("{} value(s) without a reference row", report.pending_legacy_values),
            ),
            planned(
                PipelineState::ColumnAdded,
                snapshot.reference_column,
                format!("column {}.{}", layout.fact_table, layout.reference_column),
            ),
            planned(
                PipelineState::Backfilled,
                !snapshot.legacy_column
                    || (snapshot.reference_column && !values_pending && pending_rows == 0),
                format!("{pending_rows} row(s) to update"),
            ),
            planned(
                PipelineState::Constrained,
                snapshot.foreign_key,
                format!("constraint {}", layout.constraint_name),
            ),
            planned(
                PipelineState::LegacyDropped,
                !snapshot.legacy_column,
                format!("column {}.{}", layout.fact_table, layout.legacy_column),
            ),
        ])
    }
}

/// The fact table must exist and still hold either the legacy column or
/// the reference column.
fn check_preconditions(conn: &Connection, layout: &SchemaLayout) -> Result<()> {
    let snapshot = Inspector::new(conn).snapshot(layout)?;
    if !snapshot.fact_table {
        return Err(SchemaError::Precondition(format!(
            "fact table {} does not exist; load data before migrating",
            layout.fact_table
        )));
    }
    if !snapshot.legacy_column && !snapshot.reference_column {
        return Err(SchemaError::Precondition(format!(
            "{} has neither {} nor {}",
            layout.fact_table, layout.legacy_column, layout.reference_column
        )));
    }
    Ok(())
}
