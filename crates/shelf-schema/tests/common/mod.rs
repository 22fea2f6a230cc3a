//! Shared fixtures for the normalization tests.

#![allow(dead_code)]

use rusqlite::{Connection, params};
use shelf_schema::Database;

/// Pre-migration catalog schema, as the ingestion loader creates it.
pub const CATALOG_SCHEMA: &str = "
    CREATE TABLE distribution_centers (
        id INTEGER PRIMARY KEY,
        name TEXT,
        latitude REAL,
        longitude REAL
    );
    CREATE TABLE products (
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
    INSERT INTO distribution_centers VALUES (1, 'Memphis TN', 35.1174, -89.9711);
";

/// A catalog whose product `i + 1` has legacy department `legacy[i]`.
pub fn catalog(legacy: &[Option<&str>]) -> Database {
    let order: Vec<usize> = (0..legacy.len()).collect();
    catalog_in_order(legacy, &order)
}

/// Like [`catalog`], inserting rows in the given index order.
pub fn catalog_in_order(legacy: &[Option<&str>], order: &[usize]) -> Database {
    let db = Database::open_in_memory().unwrap();
    db.execute_batch(CATALOG_SCHEMA).unwrap();
    for &i in order {
        let id = i as i64 + 1;
        db.execute(
            "INSERT INTO products (id, cost, category, name, brand, retail_price, department, sku, distribution_center_id)
             VALUES (?1, 1.5, 'Misc', ?2, 'Acme', 3.0, ?3, ?4, 1)",
            params![id, format!("Product {id}"), legacy[i], format!("SKU-{id}")],
        )
        .unwrap();
    }
    db
}

/// Reference rows as `(id, name)`, ordered by id.
pub fn departments(conn: &Connection) -> Vec<(i64, String)> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM departments ORDER BY id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Reference names, sorted.
pub fn department_names(conn: &Connection) -> Vec<String> {
    let mut names: Vec<String> = departments(conn).into_iter().map(|(_, n)| n).collect();
    names.sort();
    names
}

/// `(product id, department name)` via the foreign key, ordered by id.
pub fn product_departments(conn: &Connection) -> Vec<(i64, Option<String>)> {
    let mut stmt = conn
        .prepare(
            "SELECT p.id, d.name FROM products p
             LEFT JOIN departments d ON d.id = p.department_id
             ORDER BY p.id",
        )
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Raw `(product id, department_id)`, ordered by id.
pub fn product_reference_ids(conn: &Connection) -> Vec<(i64, Option<i64>)> {
    let mut stmt = conn
        .prepare("SELECT id, department_id FROM products ORDER BY id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Column names of a table, in order.
pub fn columns(conn: &Connection, table: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .unwrap();
    stmt.query_map([table], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Everything in `sqlite_master`, for comparing whole schemas.
pub fn schema(conn: &Connection) -> Vec<(String, String, Option<String>)> {
    let mut stmt = conn
        .prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Full observable state: schema, reference rows and fact references.
pub fn state(
    conn: &Connection,
) -> (
    Vec<(String, String, Option<String>)>,
    Vec<(i64, String)>,
    Vec<(i64, Option<i64>)>,
) {
    (schema(conn), departments(conn), product_reference_ids(conn))
}
