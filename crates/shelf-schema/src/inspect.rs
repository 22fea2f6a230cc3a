//! Live schema metadata lookups.
//!
//! Every call queries `sqlite_master` or a table-valued pragma on the
//! connection it was given. Nothing is cached, so the answers stay correct
//! when the pipeline runs repeatedly against a database that changed in
//! between.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, SchemaError};
use crate::layout::{Ident, SchemaLayout};

/// One column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// Position in the primary key, 0 when not part of it.
    pub primary_key: i64,
}

/// One foreign key as reported by `pragma_foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyInfo {
    pub column: String,
    pub referenced_table: String,
    /// `None` when the key implicitly targets the parent's primary key.
    pub referenced_column: Option<String>,
}

/// Presence of every structural element the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaSnapshot {
    pub fact_table: bool,
    pub legacy_column: bool,
    pub reference_table: bool,
    pub reference_column: bool,
    pub foreign_key: bool,
}

/// Read-only view over a connection's schema.
#[derive(Clone, Copy)]
pub struct Inspector<'c> {
    conn: &'c Connection,
}

impl<'c> Inspector<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Whether a table with this name exists.
    pub fn table_exists(&self, table: &Ident) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master
                 WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
                params![table.as_str()],
                |row| row.get(0),
            )
            .map_err(SchemaError::lookup(format!("table {table}")))
    }

    /// Whether `table` has a column named `column`.
    ///
    /// A missing table reports `false`.
    pub fn column_exists(&self, table: &Ident, column: &Ident) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1)
                 WHERE name = ?2 COLLATE NOCASE)",
                params![table.as_str(), column.as_str()],
                |row| row.get(0),
            )
            .map_err(SchemaError::lookup(format!("column {table}.{column}")))
    }

    /// Whether `table.column` carries a foreign key into `referenced_table`.
    ///
    /// SQLite keeps constraint names only in the stored DDL text, so the
    /// key is identified by its shape.
    pub fn foreign_key_exists(
        &self,
        table: &Ident,
        column: &Ident,
        referenced_table: &Ident,
    ) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_foreign_key_list(?1)
                 WHERE \"from\" = ?2 COLLATE NOCASE AND \"table\" = ?3 COLLATE NOCASE)",
                params![table.as_str(), column.as_str(), referenced_table.as_str()],
                |row| row.get(0),
            )
            .map_err(SchemaError::lookup(format!(
                "foreign key {table}.{column} -> {referenced_table}"
            )))
    }

    /// Columns of `table` in declaration order.
    pub fn columns(&self, table: &Ident) -> Result<Vec<ColumnInfo>> {
        let lookup = || SchemaError::lookup(format!("columns of {table}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(lookup())?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    decl_type: row.get(1)?,
                    not_null: row.get(2)?,
                    primary_key: row.get(3)?,
                })
            })
            .map_err(lookup())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(lookup())?;
        Ok(rows)
    }

    /// Foreign keys declared on `table`.
    pub fn foreign_keys(&self, table: &Ident) -> Result<Vec<ForeignKeyInfo>> {
        let lookup = || SchemaError::lookup(format!("foreign keys of {table}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)
                 ORDER BY id, seq",
            )
            .map_err(lookup())?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| {
                Ok(ForeignKeyInfo {
                    column: row.get(0)?,
                    referenced_table: row.get(1)?,
                    referenced_column: row.get(2)?,
                })
            })
            .map_err(lookup())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(lookup())?;
        Ok(rows)
    }

    /// The stored `CREATE TABLE` statement.
    pub fn table_sql(&self, table: &Ident) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                params![table.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(SchemaError::lookup(format!("definition of {table}")))
    }

    /// Explicitly created indexes on `table`, as their `CREATE INDEX` text.
    ///
    /// Automatic indexes backing `UNIQUE`/`PRIMARY KEY` have no stored SQL
    /// and are skipped.
    pub fn index_sql(&self, table: &Ident) -> Result<Vec<String>> {
        let lookup = || SchemaError::lookup(format!("indexes of {table}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sql FROM sqlite_master
                 WHERE type = 'index' AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL
                 ORDER BY name",
            )
            .map_err(lookup())?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| row.get(0))
            .map_err(lookup())?
            .collect::<Result<Vec<String>, _>>()
            .map_err(lookup())?;
        Ok(rows)
    }

    /// `CREATE TRIGGER` statements attached to `table`, in creation order.
    pub fn trigger_sql(&self, table: &Ident) -> Result<Vec<String>> {
        let lookup = || SchemaError::lookup(format!("triggers of {table}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sql FROM sqlite_master
                 WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL
                 ORDER BY rowid",
            )
            .map_err(lookup())?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| row.get(0))
            .map_err(lookup())?
            .collect::<Result<Vec<String>, _>>()
            .map_err(lookup())?;
        Ok(rows)
    }

    /// Names of explicitly created indexes covering `table.column`.
    pub fn indexes_on_column(&self, table: &Ident, column: &Ident) -> Result<Vec<String>> {
        let lookup = || SchemaError::lookup(format!("indexes on {table}.{column}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT il.name
                 FROM pragma_index_list(?1) AS il, pragma_index_info(il.name) AS ii
                 WHERE il.origin = 'c' AND ii.name = ?2 COLLATE NOCASE
                 ORDER BY il.name",
            )
            .map_err(lookup())?;
        let rows = stmt
            .query_map(params![table.as_str(), column.as_str()], |row| row.get(0))
            .map_err(lookup())?
            .collect::<Result<Vec<String>, _>>()
            .map_err(lookup())?;
        Ok(rows)
    }

    /// Everything the pipeline needs to decide which steps remain.
    pub fn snapshot(&self, layout: &SchemaLayout) -> Result<SchemaSnapshot> {
        let fact_table = self.table_exists(&layout.fact_table)?;
        let reference_table = self.table_exists(&layout.reference_table)?;
        Ok(SchemaSnapshot {
            fact_table,
            legacy_column: self.column_exists(&layout.fact_table, &layout.legacy_column)?,
            reference_table,
            reference_column: self.column_exists(&layout.fact_table, &layout.reference_column)?,
            foreign_key: self.foreign_key_exists(
                &layout.fact_table,
                &layout.reference_column,
                &layout.reference_table,
            )?,
        })
    }
}
