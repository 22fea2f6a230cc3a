//! `shelf check`: read-only diagnostics.

use miette::Result;
use shelf_schema::{SchemaLayout, reference_counts, structure_report, verify};

use crate::DbArgs;

pub fn run(db: &DbArgs, layout: SchemaLayout) -> Result<()> {
    let database = db.open()?;

    let structure = structure_report(&database, &layout).map_err(|e| miette::miette!("{}", e))?;
    println!("\n=== {} structure ===", layout.fact_table);
    for column in &structure.fact_columns {
        let mut flags = Vec::new();
        if column.primary_key > 0 {
            flags.push("primary key");
        }
        if column.not_null {
            flags.push("not null");
        }
        println!(
            "  {:<24} {:<10} {}",
            column.name,
            column.decl_type,
            flags.join(", ")
        );
    }
    if structure.foreign_keys.is_empty() {
        println!("\nForeign keys: none");
    } else {
        println!("\nForeign keys:");
        for fk in &structure.foreign_keys {
            println!(
                "  {} -> {}({})",
                fk.column,
                fk.referenced_table,
                fk.referenced_column.as_deref().unwrap_or("primary key")
            );
        }
    }
    if !structure.sample_row.is_empty() {
        println!("\nSample row:");
        for (column, value) in &structure.sample_row {
            println!("  {column}: {value}");
        }
    }

    let report = verify(&database, &layout).map_err(|e| miette::miette!("{}", e))?;
    println!("\n=== Normalization state ===");
    println!(
        "  {} table:      {}",
        layout.reference_table,
        if structure.reference_table_present {
            "present"
        } else {
            "absent"
        }
    );
    println!(
        "  {}.{}: {}",
        layout.fact_table,
        layout.legacy_column,
        if report.legacy_column_present {
            "present"
        } else {
            "dropped"
        }
    );
    println!(
        "  {}.{}: {}",
        layout.fact_table,
        layout.reference_column,
        if report.reference_column_present {
            "present"
        } else {
            "absent"
        }
    );
    println!(
        "  foreign key:       {}",
        if report.foreign_key_present {
            "present"
        } else {
            "absent"
        }
    );

    let findings = report.findings();
    if findings.is_empty() {
        println!("\nNormalization is complete.");
    } else {
        println!("\nOutstanding:");
        for finding in &findings {
            println!("  - {finding}");
        }
    }

    if structure.reference_table_present && structure.reference_column_present {
        let counts = reference_counts(&database, &layout).map_err(|e| miette::miette!("{}", e))?;
        println!("\n=== {} usage ===", layout.reference_table);
        for count in &counts {
            println!("  {:>4}  {:<24} {}", count.id, count.name, count.fact_rows);
        }
    }

    Ok(())
}
