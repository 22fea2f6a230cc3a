//! Read-only checks of the normalization's post-conditions.
//!
//! These work against any state of the database, before, during or after a
//! migration, so they double as a diagnostic.

use std::fmt;

use rusqlite::Connection;
use rusqlite::types::ValueRef;

use crate::error::{Result, SchemaError};
use crate::inspect::{ColumnInfo, ForeignKeyInfo, Inspector};
use crate::layout::SchemaLayout;

const REFERENCE_SAMPLE_LIMIT: usize = 5;
const FACT_SAMPLE_LIMIT: usize = 3;

/// A reference row shown in reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSample {
    pub id: i64,
    pub name: String,
}

/// A fact row joined to its reference row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactSample {
    pub id: i64,
    pub label: Option<String>,
    pub reference: String,
}

/// A violated post-condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    MissingReferenceTable,
    EmptyReferenceTable { legacy_values: u64 },
    PendingLegacyValues(u64),
    UnresolvedReferences(u64),
    MissingReferenceColumn,
    MissingForeignKey,
    LegacyColumnPresent,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingReferenceTable => write!(f, "reference table does not exist"),
            Self::EmptyReferenceTable { legacy_values } => write!(
                f,
                "reference table is empty but {legacy_values} legacy value(s) exist"
            ),
            Self::PendingLegacyValues(n) => {
                write!(f, "{n} legacy value(s) have no reference row")
            }
            Self::UnresolvedReferences(n) => {
                write!(f, "{n} fact row(s) reference a missing reference row")
            }
            Self::MissingReferenceColumn => write!(f, "reference column does not exist"),
            Self::MissingForeignKey => write!(f, "foreign key constraint is missing"),
            Self::LegacyColumnPresent => write!(f, "legacy column has not been removed"),
        }
    }
}

/// Counts and samples describing the current state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Rows in the reference table, `None` when it does not exist.
    pub reference_rows: Option<u64>,
    pub fact_rows: u64,
    /// Fact rows with a non-null reference.
    pub referenced_fact_rows: u64,
    /// Non-null references with no matching reference row.
    pub unresolved_references: u64,
    /// Distinct non-empty legacy values, `None` once the column is gone.
    pub legacy_values: Option<u64>,
    /// Distinct non-empty legacy values with no reference row.
    pub pending_legacy_values: u64,
    pub legacy_column_present: bool,
    pub reference_column_present: bool,
    pub foreign_key_present: bool,
    pub sample_references: Vec<ReferenceSample>,
    pub sample_facts: Vec<FactSample>,
}

impl VerificationReport {
    /// Every post-condition this state violates.
    pub fn findings(&self) -> Vec<Finding> {
        let mut findings = Vec::new();
        match self.reference_rows {
            None => findings.push(Finding::MissingReferenceTable),
            Some(0) => {
                if let Some(n) = self.legacy_values.filter(|n| *n > 0) {
                    findings.push(Finding::EmptyReferenceTable { legacy_values: n });
                }
            }
            Some(_) => {}
        }
        if self.pending_legacy_values > 0 {
            findings.push(Finding::PendingLegacyValues(self.pending_legacy_values));
        }
        if self.unresolved_references > 0 {
            findings.push(Finding::UnresolvedReferences(self.unresolved_references));
        }
        if !self.reference_column_present {
            findings.push(Finding::MissingReferenceColumn);
        }
        if !self.foreign_key_present {
            findings.push(Finding::MissingForeignKey);
        }
        if self.legacy_column_present {
            findings.push(Finding::LegacyColumnPresent);
        }
        findings
    }

    /// Whether the normalization is fully applied and consistent.
    pub fn is_complete(&self) -> bool {
        self.findings().is_empty()
    }
}

/// Inspect the current state of the normalization.
pub fn verify(conn: &Connection, layout: &SchemaLayout) -> Result<VerificationReport> {
    let inspector = Inspector::new(conn);
    let snapshot = inspector.snapshot(layout)?;
    if !snapshot.fact_table {
        return Err(SchemaError::Precondition(format!(
            "fact table {} does not exist",
            layout.fact_table
        )));
    }

    let fact = layout.fact_table.quoted();
    let legacy = layout.legacy_column.quoted();
    let reference = layout.reference_table.quoted();
    let rc = layout.reference_column.quoted();

    let mut report = VerificationReport {
        fact_rows: count(conn, &format!("SELECT COUNT(*) FROM {fact}"))?,
        legacy_column_present: snapshot.legacy_column,
        reference_column_present: snapshot.reference_column,
        foreign_key_present: snapshot.foreign_key,
        ..Default::default()
    };

    if snapshot.reference_table {
        report.reference_rows = Some(count(conn, &format!("SELECT COUNT(*) FROM {reference}"))?);
        report.sample_references = sample_references(conn, layout)?;
    }

    if snapshot.reference_column {
        report.referenced_fact_rows = count(
            conn,
            &format!("SELECT COUNT(*) FROM {fact} WHERE {rc} IS NOT NULL"),
        )?;
        report.unresolved_references = if snapshot.reference_table {
            count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {fact} WHERE {rc} IS NOT NULL
                     AND NOT EXISTS (SELECT 1 FROM {reference} AS r WHERE r.id = {fact}.{rc})"
                ),
            )?
        } else {
            report.referenced_fact_rows
        };
    }

    if snapshot.legacy_column {
        let distinct = format!(
            "SELECT COUNT(DISTINCT {legacy}) FROM {fact} WHERE {legacy} IS NOT NULL AND {legacy} <> ''"
        );
        let legacy_values = count(conn, &distinct)?;
        report.legacy_values = Some(legacy_values);
        report.pending_legacy_values = if snapshot.reference_table {
            count(
                conn,
                &format!(
                    "{distinct} AND NOT EXISTS (SELECT 1 FROM {reference} AS r WHERE r.name = {fact}.{legacy})"
                ),
            )?
        } else {
            legacy_values
        };
    }

    if snapshot.reference_table && snapshot.reference_column {
        report.sample_facts = sample_facts(conn, layout)?;
    }

    Ok(report)
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    conn.query_row(sql, [], |row| row.get(0))
        .map_err(SchemaError::database("verify migration"))
}

fn sample_references(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<ReferenceSample>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, name FROM {} ORDER BY id LIMIT {REFERENCE_SAMPLE_LIMIT}",
            layout.reference_table.quoted()
        ))
        .map_err(SchemaError::database("sample reference rows"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ReferenceSample {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .map_err(SchemaError::database("sample reference rows"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(SchemaError::database("sample reference rows"))?;
    Ok(rows)
}

fn sample_facts(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<FactSample>> {
    let fact = layout.fact_table.quoted();
    let label = if Inspector::new(conn).column_exists(&layout.fact_table, &layout.label_column)? {
        format!("CAST({fact}.{} AS TEXT)", layout.label_column.quoted())
    } else {
        "NULL".to_string()
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {fact}.rowid, {label}, r.name
             FROM {fact} JOIN {reference} AS r ON {fact}.{rc} = r.id
             ORDER BY {fact}.rowid LIMIT {FACT_SAMPLE_LIMIT}",
            reference = layout.reference_table.quoted(),
            rc = layout.reference_column.quoted(),
        ))
        .map_err(SchemaError::database("sample fact rows"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(FactSample {
                id: row.get(0)?,
                label: row.get(1)?,
                reference: row.get(2)?,
            })
        })
        .map_err(SchemaError::database("sample fact rows"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(SchemaError::database("sample fact rows"))?;
    Ok(rows)
}

// =============================================================================
// Structure report
// =============================================================================

/// Shape of the fact table and whether the reference table exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureReport {
    pub reference_table_present: bool,
    pub fact_columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub legacy_column_present: bool,
    pub reference_column_present: bool,
    /// First fact row as `(column, rendered value)` pairs.
    pub sample_row: Vec<(String, String)>,
}

/// Describe the fact table's current structure.
pub fn structure_report(conn: &Connection, layout: &SchemaLayout) -> Result<StructureReport> {
    let inspector = Inspector::new(conn);
    let snapshot = inspector.snapshot(layout)?;
    if !snapshot.fact_table {
        return Err(SchemaError::Precondition(format!(
            "fact table {} does not exist",
            layout.fact_table
        )));
    }

    Ok(StructureReport {
        reference_table_present: snapshot.reference_table,
        fact_columns: inspector.columns(&layout.fact_table)?,
        foreign_keys: inspector.foreign_keys(&layout.fact_table)?,
        legacy_column_present: snapshot.legacy_column,
        reference_column_present: snapshot.reference_column,
        sample_row: sample_row(conn, layout)?,
    })
}

fn sample_row(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT * FROM {} ORDER BY rowid LIMIT 1",
            layout.fact_table.quoted()
        ))
        .map_err(SchemaError::database("sample fact row"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt
        .query([])
        .map_err(SchemaError::database("sample fact row"))?;
    let Some(row) = rows
        .next()
        .map_err(SchemaError::database("sample fact row"))?
    else {
        return Ok(Vec::new());
    };

    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let value = row
                .get_ref(i)
                .map_err(SchemaError::database("sample fact row"))?;
            Ok((name, render_value(value)))
        })
        .collect()
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} byte blob>", b.len()),
    }
}

// =============================================================================
// Reference usage
// =============================================================================

/// A reference row and how many fact rows point at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCount {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub fact_rows: u64,
}

/// Every reference row with its fact row count, ordered by name.
pub fn reference_counts(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<ReferenceCount>> {
    let snapshot = Inspector::new(conn).snapshot(layout)?;
    if !snapshot.reference_table || !snapshot.reference_column {
        return Err(SchemaError::Precondition(format!(
            "{}.{} and {} must exist to count references",
            layout.fact_table, layout.reference_column, layout.reference_table
        )));
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT r.id, r.name, r.description, COUNT(f.rowid)
             FROM {reference} AS r
             LEFT JOIN {fact} AS f ON f.{rc} = r.id
             GROUP BY r.id, r.name, r.description
             ORDER BY r.name",
            reference = layout.reference_table.quoted(),
            fact = layout.fact_table.quoted(),
            rc = layout.reference_column.quoted(),
        ))
        .map_err(SchemaError::database("count references"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ReferenceCount {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                fact_rows: row.get(3)?,
            })
        })
        .map_err(SchemaError::database("count references"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(SchemaError::database("count references"))?;
    Ok(rows)
}
