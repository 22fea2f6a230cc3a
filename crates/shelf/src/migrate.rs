//! `shelf migrate`: run or preview the department normalization.

use std::time::Duration;

use miette::Result;
use shelf_schema::{MigrationSummary, Outcome, Pipeline, SchemaLayout, StepReport, StepStatus};

use crate::DbArgs;

pub fn run(db: &DbArgs, layout: SchemaLayout, dry_run: bool, lock_ttl: Duration) -> Result<()> {
    let database = db.open()?;

    println!(
        "\n=== Normalize {}.{} into {} ===\n",
        layout.fact_table, layout.legacy_column, layout.reference_table
    );

    if dry_run {
        let plan = Pipeline::new(&database, layout)
            .plan()
            .map_err(|e| miette::miette!("{}", e))?;
        let pending = plan
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .count();
        for step in &plan {
            let status = match step.status {
                StepStatus::Pending => "[PENDING]",
                StepStatus::Done => "[DONE]   ",
            };
            println!("  {} {}", status, step.state);
            println!("      {}", step.detail);
        }
        println!("\nDry-run: {pending} step(s) would run");
        return Ok(());
    }

    let mut pipeline = Pipeline::new(&database, layout)
        .with_lock_ttl(lock_ttl)
        .on_progress(print_step);
    match pipeline.run() {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => {
            println!("\nFAILED after '{}'", e.reached);
            println!("The database was left in that state; fix the cause and re-run.");
            Err(miette::miette!("{}", e))
        }
    }
}

fn print_step(step: &StepReport) {
    let marker = match step.outcome {
        Outcome::Applied => "applied",
        Outcome::AlreadyApplied => "skipped",
    };
    println!("  [{marker}] {}: {}", step.state, step.detail);
}

fn print_summary(summary: &MigrationSummary) {
    let report = &summary.report;
    println!("\nMigration complete.");
    println!("  Distinct values found:   {}", summary.extracted);
    println!(
        "  Reference rows inserted: {} ({} already present)",
        summary.populate.inserted, summary.populate.skipped
    );
    println!(
        "  References assigned:     {} ({} cleared)",
        summary.backfill.assigned, summary.backfill.cleared
    );
    println!(
        "  Reference rows:          {}",
        report.reference_rows.unwrap_or_default()
    );
    println!(
        "  Fact rows:               {} ({} with a reference)",
        report.fact_rows, report.referenced_fact_rows
    );

    if !report.sample_references.is_empty() {
        println!("\nSample reference rows:");
        for r in &report.sample_references {
            println!("  {:>4}  {}", r.id, r.name);
        }
    }
    if !report.sample_facts.is_empty() {
        println!("\nSample rows:");
        for f in &report.sample_facts {
            println!(
                "  {:>6}  {} -> {}",
                f.id,
                f.label.as_deref().unwrap_or("-"),
                f.reference
            );
        }
    }
}
