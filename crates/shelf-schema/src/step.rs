//! Step outcomes and the proofs that chain the steps together.
//!
//! Each step returns a proof value that only that step can construct, and
//! the next step takes it by reference. Dropping the legacy column needs a
//! [`Constrained`], which needs a [`Backfilled`], and so on back to the
//! reference table, so the steps cannot be called out of order.

/// Whether a step changed the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The step made a change.
    Applied,
    /// The target state was already present; nothing was changed.
    AlreadyApplied,
}

impl Outcome {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Applied
        } else {
            Self::AlreadyApplied
        }
    }

    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

/// Counts from populating the reference table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateSummary {
    /// Values newly inserted.
    pub inserted: usize,
    /// Values that were already present.
    pub skipped: usize,
}

/// Counts from backfilling the reference column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Rows whose reference was set or corrected.
    pub assigned: usize,
    /// Rows whose stale reference was reset to NULL.
    pub cleared: usize,
}

/// The reference table exists.
#[derive(Debug)]
pub struct ReferenceTable {
    outcome: Outcome,
}

impl ReferenceTable {
    pub(crate) fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

/// Every extracted legacy value has a reference row.
#[derive(Debug)]
pub struct Populated {
    summary: PopulateSummary,
}

impl Populated {
    pub(crate) fn new(summary: PopulateSummary) -> Self {
        Self { summary }
    }

    pub fn summary(&self) -> PopulateSummary {
        self.summary
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from_changed(self.summary.inserted > 0)
    }
}

/// The fact table has its reference column.
#[derive(Debug)]
pub struct ColumnAdded {
    outcome: Outcome,
}

impl ColumnAdded {
    pub(crate) fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

/// The reference column agrees with the legacy column.
#[derive(Debug)]
pub struct Backfilled {
    summary: BackfillSummary,
    skipped: bool,
}

impl Backfilled {
    pub(crate) fn new(summary: BackfillSummary) -> Self {
        Self {
            summary,
            skipped: false,
        }
    }

    /// Backfill had nothing to read because the legacy column is gone.
    pub(crate) fn retired() -> Self {
        Self {
            summary: BackfillSummary::default(),
            skipped: true,
        }
    }

    pub fn summary(&self) -> BackfillSummary {
        self.summary
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from_changed(
            !self.skipped && self.summary.assigned + self.summary.cleared > 0,
        )
    }
}

/// The foreign-key constraint is in place.
#[derive(Debug)]
pub struct Constrained {
    outcome: Outcome,
}

impl Constrained {
    pub(crate) fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}
