//! Reference table creation and population.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{DbErrorKind, Result, SchemaError};
use crate::inspect::Inspector;
use crate::layout::{Ident, SchemaLayout};
use crate::step::{Outcome, PopulateSummary, Populated, ReferenceTable};

/// Create the reference table unless it already exists.
pub fn ensure_reference_table(conn: &Connection, layout: &SchemaLayout) -> Result<ReferenceTable> {
    let table = &layout.reference_table;
    if Inspector::new(conn).table_exists(table)? {
        info!(table = %table, "reference table already exists");
        return Ok(ReferenceTable::new(Outcome::AlreadyApplied));
    }

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL UNIQUE,
             description TEXT
         )",
        table = table.quoted(),
    ))
    .map_err(SchemaError::database("create reference table"))?;

    info!(table = %table, "created reference table");
    Ok(ReferenceTable::new(Outcome::Applied))
}

/// Distinct non-null, non-empty values of `table.column`, sorted ascending by
/// byte order.
///
/// Returns an empty list once the column has been retired.
pub fn extract_distinct(conn: &Connection, table: &Ident, column: &Ident) -> Result<Vec<String>> {
    let inspector = Inspector::new(conn);
    if !inspector.table_exists(table)? {
        return Err(SchemaError::Precondition(format!(
            "source table {table} does not exist"
        )));
    }
    if !inspector.column_exists(table, column)? {
        info!(table = %table, column = %column, "source column already retired; nothing to extract");
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT {column} FROM {table}
             WHERE {column} IS NOT NULL AND {column} <> ''
             ORDER BY {column} COLLATE BINARY",
            column = column.quoted(),
            table = table.quoted(),
        ))
        .map_err(SchemaError::database("extract distinct values"))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(SchemaError::database("extract distinct values"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(SchemaError::database("extract distinct values"))?;

    info!(table = %table, column = %column, count = values.len(), "extracted distinct values");
    Ok(values)
}

/// Insert each value into the reference table.
///
/// All inserts share one transaction. A value that is already present
/// trips the `UNIQUE` constraint, which is counted as a skip; any other
/// failure rolls the whole step back. Empty strings are never inserted.
pub fn populate(
    conn: &Connection,
    layout: &SchemaLayout,
    _table: &ReferenceTable,
    values: &[String],
) -> Result<Populated> {
    let tx = conn
        .unchecked_transaction()
        .map_err(SchemaError::database("populate reference table"))?;
    let mut summary = PopulateSummary::default();
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {table} (name) VALUES (?1)",
                table = layout.reference_table.quoted(),
            ))
            .map_err(SchemaError::database("populate reference table"))?;

        for value in values.iter().filter(|v| !v.is_empty()) {
            match stmt.execute([value]) {
                Ok(_) => summary.inserted += 1,
                Err(err) if DbErrorKind::classify(&err).is_benign() => {
                    debug!(value = %value, "reference value already present");
                    summary.skipped += 1;
                }
                Err(err) => return Err(SchemaError::database("populate reference table")(err)),
            }
        }
    }
    tx.commit()
        .map_err(SchemaError::database("populate reference table"))?;

    info!(
        table = %layout.reference_table,
        inserted = summary.inserted,
        skipped = summary.skipped,
        "populated reference table"
    );
    Ok(Populated::new(summary))
}
