//! Table and column naming for the normalization.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SchemaError};

/// Longest identifier accepted.
pub(crate) const MAX_IDENT_LEN: usize = 64;

/// A validated SQL identifier.
///
/// Only ASCII letters, digits and underscores are accepted, so the quoted
/// form can be interpolated into DDL, which cannot take bound parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    /// Validate and wrap an identifier.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        let reserved = name.to_ascii_lowercase().starts_with("sqlite_");

        if !valid_start || !valid_rest || reserved || name.len() > MAX_IDENT_LEN {
            return Err(SchemaError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    /// Wrap a name known to be valid at compile time.
    pub(crate) fn known(name: &str) -> Self {
        debug_assert!(Self::new(name).is_ok(), "invalid built-in identifier {name}");
        Self(name.to_string())
    }

    /// The bare name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The double-quoted form for SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Ident {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Names of everything the normalization touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLayout {
    /// Fact table holding the denormalized column.
    pub fact_table: Ident,
    /// Free-text category column being retired.
    pub legacy_column: Ident,
    /// Lookup table created by the migration.
    pub reference_table: Ident,
    /// Foreign-key column added to the fact table.
    pub reference_column: Ident,
    /// Name of the foreign-key constraint.
    pub constraint_name: Ident,
    /// Fact column shown in sample output.
    pub label_column: Ident,
}

impl SchemaLayout {
    /// Build a layout, deriving the constraint name as `fk_<fact>_<legacy>`.
    pub fn new(
        fact_table: Ident,
        legacy_column: Ident,
        reference_table: Ident,
        reference_column: Ident,
    ) -> Result<Self> {
        let constraint_name = Ident::new(format!("fk_{fact_table}_{legacy_column}"))?;
        Ok(Self {
            fact_table,
            legacy_column,
            reference_table,
            reference_column,
            constraint_name,
            label_column: Ident::known("name"),
        })
    }

    /// Override the sample label column.
    pub fn with_label_column(mut self, label_column: Ident) -> Self {
        self.label_column = label_column;
        self
    }

    /// Name of the advisory lock guarding this normalization.
    pub fn lock_name(&self) -> String {
        format!("normalize:{}.{}", self.fact_table, self.legacy_column)
    }
}

impl Default for SchemaLayout {
    fn default() -> Self {
        Self {
            fact_table: Ident::known("products"),
            legacy_column: Ident::known("department"),
            reference_table: Ident::known("departments"),
            reference_column: Ident::known("department_id"),
            constraint_name: Ident::known("fk_products_department"),
            label_column: Ident::known("name"),
        }
    }
}
