//! `shelf ingest`: load the catalog CSV export.

use std::path::PathBuf;

use miette::Result;
use shelf_ingest::{Sources, ingest, verify_load};

use crate::DbArgs;

pub fn run(db: &DbArgs, products: PathBuf, distribution_centers: PathBuf) -> Result<()> {
    let sources = Sources::new(products, distribution_centers);
    // Report missing files before creating the database.
    sources.check().map_err(|e| miette::miette!("{}", e))?;

    let database = db.open()?;
    println!("\n=== Loading catalog ===\n");
    let summary = ingest(&database, &sources).map_err(|e| miette::miette!("{}", e))?;
    println!("Loaded {} distribution centers", summary.distribution_centers);
    println!("Loaded {} products", summary.products);

    let report = verify_load(&database).map_err(|e| miette::miette!("{}", e))?;
    println!("\n=== Data verification ===");
    println!("Distribution centers: {} records", report.distribution_centers);
    println!("Products: {} records", report.products);

    println!("\nSample distribution centers:");
    for dc in &report.sample_distribution_centers {
        println!(
            "  ID: {}, Name: {}, Lat: {}, Long: {}",
            dc.id,
            dc.name.as_deref().unwrap_or("-"),
            dc.latitude.map_or_else(|| "-".to_string(), |v| v.to_string()),
            dc.longitude.map_or_else(|| "-".to_string(), |v| v.to_string()),
        );
    }

    println!("\nSample products:");
    for p in &report.sample_products {
        println!(
            "  ID: {}, Name: {}, Brand: {}, Price: {}",
            p.id,
            p.name.as_deref().unwrap_or("-"),
            p.brand.as_deref().unwrap_or("-"),
            p.retail_price
                .map_or_else(|| "-".to_string(), |v| format!("${v:.2}")),
        );
    }

    println!(
        "\nProducts with a known distribution center: {}",
        report.resolved_distribution_centers
    );
    Ok(())
}
