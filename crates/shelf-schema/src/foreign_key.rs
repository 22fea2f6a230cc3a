//! The reference column on the fact table: adding it, backfilling it, and
//! constraining it.

use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use tracing::{error, info, warn};

use crate::error::{Result, SchemaError};
use crate::inspect::Inspector;
use crate::layout::{Ident, MAX_IDENT_LEN, SchemaLayout};
use crate::step::{
    BackfillSummary, Backfilled, ColumnAdded, Constrained, Outcome, Populated, ReferenceTable,
};

/// How many failing row ids an integrity error carries.
const ORPHAN_SAMPLE_LIMIT: i64 = 10;

/// Add the nullable reference column unless it already exists.
pub fn add_reference_column(
    conn: &Connection,
    layout: &SchemaLayout,
    _table: &ReferenceTable,
) -> Result<ColumnAdded> {
    let (fact, column) = (&layout.fact_table, &layout.reference_column);
    if Inspector::new(conn).column_exists(fact, column)? {
        info!(table = %fact, column = %column, "reference column already exists");
        return Ok(ColumnAdded::new(Outcome::AlreadyApplied));
    }

    conn.execute_batch(&format!(
        "ALTER TABLE {fact} ADD COLUMN {column} INTEGER",
        fact = fact.quoted(),
        column = column.quoted(),
    ))
    .map_err(SchemaError::database("add reference column"))?;

    info!(table = %fact, column = %column, "added reference column");
    Ok(ColumnAdded::new(Outcome::Applied))
}

/// Point every fact row at the reference row named by its legacy value.
///
/// Matching is exact and case-sensitive. Rows whose legacy value is null,
/// empty, or has no reference row end up with a NULL reference; rows that
/// already hold the right id are left untouched. Both updates run in one
/// transaction.
pub fn backfill(
    conn: &Connection,
    layout: &SchemaLayout,
    _populated: &Populated,
    _column: &ColumnAdded,
) -> Result<Backfilled> {
    if !Inspector::new(conn).column_exists(&layout.fact_table, &layout.legacy_column)? {
        info!(
            table = %layout.fact_table,
            column = %layout.legacy_column,
            "legacy column already retired; nothing to backfill"
        );
        return Ok(Backfilled::retired());
    }

    let names = SqlNames::new(layout);
    let tx = conn
        .unchecked_transaction()
        .map_err(SchemaError::database("backfill reference column"))?;

    let assigned = tx
        .execute(
            &format!(
                "UPDATE {fact} SET {rc} = r.id
                 FROM {reference} AS r
                 WHERE {fact}.{legacy} = r.name
                   AND {fact}.{legacy} <> ''
                   AND ({fact}.{rc} IS NULL OR {fact}.{rc} <> r.id)",
                fact = names.fact,
                rc = names.reference_column,
                reference = names.reference_table,
                legacy = names.legacy_column,
            ),
            [],
        )
        .map_err(SchemaError::database("backfill reference column"))?;

    let cleared = tx
        .execute(
            &format!(
                "UPDATE {fact} SET {rc} = NULL
                 WHERE {rc} IS NOT NULL
                   AND ({legacy} IS NULL
                        OR {legacy} = ''
                        OR NOT EXISTS (SELECT 1 FROM {reference} AS r WHERE r.name = {fact}.{legacy}))",
                fact = names.fact,
                rc = names.reference_column,
                reference = names.reference_table,
                legacy = names.legacy_column,
            ),
            [],
        )
        .map_err(SchemaError::database("backfill reference column"))?;

    tx.commit()
        .map_err(SchemaError::database("backfill reference column"))?;

    let summary = BackfillSummary { assigned, cleared };
    info!(
        table = %layout.fact_table,
        assigned = summary.assigned,
        cleared = summary.cleared,
        "backfilled reference column"
    );
    Ok(Backfilled::new(summary))
}

/// Number of fact rows a backfill would change right now.
///
/// Zero when the legacy or reference column is missing.
pub fn pending_backfill(conn: &Connection, layout: &SchemaLayout) -> Result<u64> {
    let inspector = Inspector::new(conn);
    let ready = inspector.column_exists(&layout.fact_table, &layout.legacy_column)?
        && inspector.column_exists(&layout.fact_table, &layout.reference_column)?
        && inspector.table_exists(&layout.reference_table)?;
    if !ready {
        return Ok(0);
    }

    let names = SqlNames::new(layout);
    conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {fact}
             LEFT JOIN {reference} AS r ON r.name = {fact}.{legacy} AND {fact}.{legacy} <> ''
             WHERE {fact}.{rc} IS NOT r.id",
            fact = names.fact,
            rc = names.reference_column,
            reference = names.reference_table,
            legacy = names.legacy_column,
        ),
        [],
        |row| row.get(0),
    )
    .map_err(SchemaError::database("count pending backfill"))
}

/// Add the foreign key from the reference column to the reference table.
///
/// SQLite cannot add a constraint to an existing table, so the fact table
/// is rebuilt with the constraint appended to its stored definition, inside
/// one transaction. Before the rebuild every non-null reference must
/// resolve; if any does not, the step fails with
/// [`SchemaError::Integrity`] and nothing changes.
pub fn add_constraint(
    conn: &Connection,
    layout: &SchemaLayout,
    _backfilled: &Backfilled,
) -> Result<Constrained> {
    let inspector = Inspector::new(conn);
    let fact = &layout.fact_table;
    if inspector.foreign_key_exists(fact, &layout.reference_column, &layout.reference_table)? {
        info!(constraint = %layout.constraint_name, "foreign key constraint already exists");
        return Ok(Constrained::new(Outcome::AlreadyApplied));
    }

    check_orphans(conn, layout)?;

    let definition = inspector
        .table_sql(fact)?
        .ok_or_else(|| SchemaError::Precondition(format!("fact table {fact} does not exist")))?;
    let indexes = inspector.index_sql(fact)?;
    let triggers = inspector.trigger_sql(fact)?;
    let staging = staging_name(fact)?;
    let create = constrained_definition(&definition, &staging, layout)?;

    // Must be switched off outside any transaction, or SQLite ignores it.
    let _enforcement = PragmaOverride::set(conn, "foreign_keys", false)?;
    // Views and triggers that name the fact table must survive it being
    // dropped and renamed back without being re-parsed.
    let _legacy_rename = PragmaOverride::set(conn, "legacy_alter_table", true)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(SchemaError::database("add foreign key constraint"))?;

    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {staging};
         {create};
         INSERT INTO {staging} SELECT * FROM {fact};
         DROP TABLE {fact};
         ALTER TABLE {staging} RENAME TO {fact};",
        staging = staging.quoted(),
        fact = fact.quoted(),
    ))
    .map_err(SchemaError::database("add foreign key constraint"))?;

    for index in &indexes {
        tx.execute_batch(index)
            .map_err(SchemaError::database("recreate fact table indexes"))?;
    }
    for trigger in &triggers {
        tx.execute_batch(trigger)
            .map_err(SchemaError::database("recreate fact table triggers"))?;
    }

    let violations = foreign_key_violations(&tx, fact, &layout.reference_table)?;
    if !violations.is_empty() {
        error!(
            table = %fact,
            orphaned = violations.len(),
            "foreign key check failed after rebuild"
        );
        return Err(SchemaError::Integrity {
            reference_table: layout.reference_table.to_string(),
            orphaned: violations.len() as u64,
            sample_ids: violations
                .into_iter()
                .take(ORPHAN_SAMPLE_LIMIT as usize)
                .collect(),
        });
    }

    tx.commit()
        .map_err(SchemaError::database("add foreign key constraint"))?;

    info!(
        constraint = %layout.constraint_name,
        table = %fact,
        column = %layout.reference_column,
        references = %layout.reference_table,
        indexes = indexes.len(),
        triggers = triggers.len(),
        "added foreign key constraint"
    );
    Ok(Constrained::new(Outcome::Applied))
}

/// Fail with [`SchemaError::Integrity`] if any non-null reference does not
/// resolve.
fn check_orphans(conn: &Connection, layout: &SchemaLayout) -> Result<()> {
    let names = SqlNames::new(layout);
    let orphan_filter = format!(
        "FROM {fact} WHERE {rc} IS NOT NULL
         AND NOT EXISTS (SELECT 1 FROM {reference} AS r WHERE r.id = {fact}.{rc})",
        fact = names.fact,
        rc = names.reference_column,
        reference = names.reference_table,
    );

    let orphaned: u64 = conn
        .query_row(&format!("SELECT COUNT(*) {orphan_filter}"), [], |row| {
            row.get(0)
        })
        .map_err(SchemaError::database("check unresolved references"))?;
    if orphaned == 0 {
        return Ok(());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {fact}.rowid {orphan_filter} ORDER BY {fact}.rowid LIMIT ?1",
            fact = names.fact,
        ))
        .map_err(SchemaError::database("check unresolved references"))?;
    let sample_ids = stmt
        .query_map(params![ORPHAN_SAMPLE_LIMIT], |row| row.get(0))
        .map_err(SchemaError::database("check unresolved references"))?
        .collect::<Result<Vec<i64>, _>>()
        .map_err(SchemaError::database("check unresolved references"))?;

    error!(
        table = %layout.fact_table,
        orphaned,
        ?sample_ids,
        "references do not resolve; refusing to add constraint"
    );
    Err(SchemaError::Integrity {
        reference_table: layout.reference_table.to_string(),
        orphaned,
        sample_ids,
    })
}

/// Row ids of `table` violating a foreign key into `parent`.
fn foreign_key_violations(conn: &Connection, table: &Ident, parent: &Ident) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_check({})", table.quoted()))
        .map_err(SchemaError::database("foreign key check"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(2)?, row.get::<_, Option<i64>>(1)?))
        })
        .map_err(SchemaError::database("foreign key check"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(SchemaError::database("foreign key check"))?;

    Ok(rows
        .into_iter()
        .filter(|(p, _)| p.eq_ignore_ascii_case(parent.as_str()))
        .map(|(_, rowid)| rowid.unwrap_or_default())
        .collect())
}

/// Name of the temporary copy of `fact`, kept within the identifier limit.
fn staging_name(fact: &Ident) -> Result<Ident> {
    const SUFFIX: &str = "__rebuild";
    let name = fact.as_str();
    // Identifiers are ASCII, so any byte offset is a char boundary.
    let base = &name[..name.len().min(MAX_IDENT_LEN - SUFFIX.len())];
    Ident::new(format!("{base}{SUFFIX}"))
}

/// Append the foreign-key clause to a stored `CREATE TABLE` statement and
/// retarget it at `staging`.
fn constrained_definition(definition: &str, staging: &Ident, layout: &SchemaLayout) -> Result<String> {
    let malformed =
        || SchemaError::Precondition(format!("cannot parse definition of {}", layout.fact_table));
    let open = definition.find('(').ok_or_else(malformed)?;
    let close = definition.rfind(')').ok_or_else(malformed)?;
    if close <= open {
        return Err(malformed());
    }

    let columns = definition[open + 1..close].trim_end();
    let options = &definition[close + 1..];
    Ok(format!(
        "CREATE TABLE {staging} ({columns},\n    CONSTRAINT {name} FOREIGN KEY ({rc}) REFERENCES {reference}(id)){options}",
        staging = staging.quoted(),
        name = layout.constraint_name.quoted(),
        rc = layout.reference_column.quoted(),
        reference = layout.reference_table.quoted(),
    ))
}

/// Quoted names used in the statements above.
struct SqlNames {
    fact: String,
    legacy_column: String,
    reference_table: String,
    reference_column: String,
}

impl SqlNames {
    fn new(layout: &SchemaLayout) -> Self {
        Self {
            fact: layout.fact_table.quoted(),
            legacy_column: layout.legacy_column.quoted(),
            reference_table: layout.reference_table.quoted(),
            reference_column: layout.reference_column.quoted(),
        }
    }
}

/// Holds a boolean connection pragma at a fixed value until dropped, then
/// restores whatever the connection had before.
struct PragmaOverride<'c> {
    conn: &'c Connection,
    pragma: &'static str,
    previous: bool,
}

impl<'c> PragmaOverride<'c> {
    fn set(conn: &'c Connection, pragma: &'static str, value: bool) -> Result<Self> {
        let previous = conn
            .pragma_query_value(None, pragma, |row| row.get(0))
            .map_err(SchemaError::lookup(format!("pragma {pragma}")))?;
        conn.pragma_update(None, pragma, value)
            .map_err(SchemaError::database("set connection pragma"))?;
        Ok(Self {
            conn,
            pragma,
            previous,
        })
    }
}

impl Drop for PragmaOverride<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.pragma_update(None, self.pragma, self.previous) {
            warn!(pragma = self.pragma, error = %e, "failed to restore connection pragma");
        }
    }
}
