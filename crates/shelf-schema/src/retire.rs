//! Retirement of the denormalized column.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SchemaError};
use crate::inspect::Inspector;
use crate::layout::{Ident, SchemaLayout};
use crate::step::{Constrained, Outcome};

/// Drop the legacy column, along with any explicit index covering it.
///
/// Requires the [`Constrained`] proof, so it can only follow a successful
/// constraint step. An already-absent column is a no-op.
pub fn drop_legacy_column(
    conn: &Connection,
    layout: &SchemaLayout,
    _constrained: &Constrained,
) -> Result<Outcome> {
    let inspector = Inspector::new(conn);
    let (fact, legacy) = (&layout.fact_table, &layout.legacy_column);
    if !inspector.column_exists(fact, legacy)? {
        info!(table = %fact, column = %legacy, "legacy column already removed");
        return Ok(Outcome::AlreadyApplied);
    }

    let indexes = inspector.indexes_on_column(fact, legacy)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(SchemaError::database("drop legacy column"))?;
    for index in &indexes {
        let index = Ident::new(index.as_str())?;
        tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", index.quoted()))
            .map_err(SchemaError::database("drop legacy column index"))?;
    }
    tx.execute_batch(&format!(
        "ALTER TABLE {fact} DROP COLUMN {legacy}",
        fact = fact.quoted(),
        legacy = legacy.quoted(),
    ))
    .map_err(SchemaError::database("drop legacy column"))?;
    tx.commit()
        .map_err(SchemaError::database("drop legacy column"))?;

    info!(table = %fact, column = %legacy, dropped_indexes = indexes.len(), "removed legacy column");
    Ok(Outcome::Applied)
}
