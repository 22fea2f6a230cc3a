//! Loading the catalog CSVs into the pre-migration schema.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde::de::DeserializeOwned;
use shelf_schema::{Inspector, SchemaLayout};
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::records::{DistributionCenterRecord, ProductRecord};

pub type Result<T> = std::result::Result<T, IngestError>;

/// Catalog tables as they exist before normalization.
pub const CATALOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS distribution_centers (
        id INTEGER PRIMARY KEY,
        name TEXT,
        latitude REAL,
        longitude REAL
    );
    CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY,
        cost REAL,
        category TEXT,
        name TEXT,
        brand TEXT,
        retail_price REAL,
        department TEXT,
        sku TEXT,
        distribution_center_id INTEGER REFERENCES distribution_centers(id)
    );
";

/// Number of rows shown per table in a [`LoadReport`].
const SAMPLE_ROWS: usize = 3;

/// The two input files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sources {
    pub products: PathBuf,
    pub distribution_centers: PathBuf,
}

impl Sources {
    pub fn new(products: impl Into<PathBuf>, distribution_centers: impl Into<PathBuf>) -> Self {
        Self {
            products: products.into(),
            distribution_centers: distribution_centers.into(),
        }
    }

    /// Fail with [`IngestError::MissingFile`] unless both files exist.
    pub fn check(&self) -> Result<()> {
        for path in [&self.distribution_centers, &self.products] {
            if !path.is_file() {
                return Err(IngestError::MissingFile(path.clone()));
            }
        }
        Ok(())
    }
}

/// Rows written by one ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub distribution_centers: usize,
    pub products: usize,
}

/// Create the catalog tables if absent.
///
/// Refuses a products table that no longer has its `department` column:
/// loading into a normalized catalog would silently drop every department.
pub fn create_schema(conn: &Connection) -> Result<()> {
    let layout = SchemaLayout::default();
    let inspector = Inspector::new(conn);
    if inspector.table_exists(&layout.fact_table)?
        && !inspector.column_exists(&layout.fact_table, &layout.legacy_column)?
    {
        return Err(IngestError::Precondition(format!(
            "{}.{} is absent; the catalog has already been normalized",
            layout.fact_table, layout.legacy_column
        )));
    }

    conn.execute_batch(CATALOG_SCHEMA)
        .map_err(IngestError::database("create catalog tables"))?;
    debug!("catalog tables ready");
    Ok(())
}

/// Replace the catalog contents with the rows in `sources`.
pub fn ingest(conn: &Connection, sources: &Sources) -> Result<IngestSummary> {
    sources.check()?;
    info!(
        products = %sources.products.display(),
        distribution_centers = %sources.distribution_centers.display(),
        "loading catalog"
    );

    let distribution_centers = read_path::<DistributionCenterRecord>(&sources.distribution_centers)?;
    let products = read_path::<ProductRecord>(&sources.products)?;
    load(conn, &distribution_centers, &products)
}

/// Like [`ingest`], reading CSV from arbitrary readers.
pub fn ingest_readers(
    conn: &Connection,
    distribution_centers: impl Read,
    products: impl Read,
) -> Result<IngestSummary> {
    let distribution_centers = read_records(distribution_centers, "distribution_centers")?;
    let products = read_records(products, "products")?;
    load(conn, &distribution_centers, &products)
}

fn read_path<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)?;
    read_records(BufReader::new(file), &path.display().to_string())
}

fn read_records<T: DeserializeOwned>(reader: impl Read, file: &str) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .double_quote(true)
        .flexible(false)
        .from_reader(reader);
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(IngestError::csv(file))?;
    debug!(file, rows = records.len(), "parsed csv");
    Ok(records)
}

/// Clear both tables and insert the records in one transaction.
fn load(
    conn: &Connection,
    distribution_centers: &[DistributionCenterRecord],
    products: &[ProductRecord],
) -> Result<IngestSummary> {
    create_schema(conn)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(IngestError::database("begin load"))?;

    // Products reference distribution centers.
    let cleared_products = tx
        .execute("DELETE FROM products", [])
        .map_err(IngestError::database("clear products"))?;
    let cleared_centers = tx
        .execute("DELETE FROM distribution_centers", [])
        .map_err(IngestError::database("clear distribution centers"))?;
    if cleared_products + cleared_centers > 0 {
        warn!(
            products = cleared_products,
            distribution_centers = cleared_centers,
            "replacing existing catalog rows"
        );
    }

    {
        let mut insert = tx
            .prepare(
                "INSERT INTO distribution_centers (id, name, latitude, longitude)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(IngestError::database("prepare distribution center insert"))?;
        for dc in distribution_centers {
            insert
                .execute(params![dc.id, dc.name, dc.latitude, dc.longitude])
                .map_err(IngestError::database("insert distribution center"))?;
        }
    }

    {
        let mut insert = tx
            .prepare(
                "INSERT INTO products
                     (id, cost, category, name, brand, retail_price, department, sku, distribution_center_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .map_err(IngestError::database("prepare product insert"))?;
        for p in products {
            insert
                .execute(params![
                    p.id,
                    p.cost,
                    p.category,
                    p.name,
                    p.brand,
                    p.retail_price,
                    p.department,
                    p.sku,
                    p.distribution_center_id,
                ])
                .map_err(IngestError::database("insert product"))?;
        }
    }

    tx.commit().map_err(IngestError::database("commit load"))?;

    let summary = IngestSummary {
        distribution_centers: distribution_centers.len(),
        products: products.len(),
    };
    info!(
        distribution_centers = summary.distribution_centers,
        products = summary.products,
        "catalog loaded"
    );
    Ok(summary)
}

/// A product as shown in a [`LoadReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSample {
    pub id: i64,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub retail_price: Option<f64>,
}

/// Post-load snapshot of the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub distribution_centers: u64,
    pub products: u64,
    pub sample_distribution_centers: Vec<DistributionCenterRecord>,
    pub sample_products: Vec<ProductSample>,
    /// Products whose distribution center exists.
    pub resolved_distribution_centers: u64,
}

/// Count and sample what is in the catalog tables.
pub fn verify_load(conn: &Connection) -> Result<LoadReport> {
    let count = |sql: &str, step: &'static str| -> Result<u64> {
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(IngestError::database(step))
    };

    let distribution_centers = count(
        "SELECT COUNT(*) FROM distribution_centers",
        "count distribution centers",
    )?;
    let products = count("SELECT COUNT(*) FROM products", "count products")?;
    let resolved_distribution_centers = count(
        "SELECT COUNT(*) FROM products p
         JOIN distribution_centers dc ON p.distribution_center_id = dc.id",
        "count distribution center relationships",
    )?;

    let sample_distribution_centers = {
        let mut stmt = conn
            .prepare(
                "SELECT id, name, latitude, longitude FROM distribution_centers
                 ORDER BY id LIMIT ?1",
            )
            .map_err(IngestError::database("sample distribution centers"))?;
        let rows = stmt
            .query_map([SAMPLE_ROWS as i64], |row| {
                Ok(DistributionCenterRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(IngestError::database("sample distribution centers"))?;
        rows
    };

    let sample_products = {
        let mut stmt = conn
            .prepare("SELECT id, name, brand, retail_price FROM products ORDER BY id LIMIT ?1")
            .map_err(IngestError::database("sample products"))?;
        let rows = stmt
            .query_map([SAMPLE_ROWS as i64], |row| {
                Ok(ProductSample {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    brand: row.get(2)?,
                    retail_price: row.get(3)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(IngestError::database("sample products"))?;
        rows
    };

    Ok(LoadReport {
        distribution_centers,
        products,
        sample_distribution_centers,
        sample_products,
        resolved_distribution_centers,
    })
}
