//! End-to-end behaviour of the normalization pipeline and its steps.

mod common;

use pretty_assertions::assert_eq;
use shelf_schema::foreign_key::{add_constraint, add_reference_column, backfill};
use shelf_schema::materialize::{ensure_reference_table, extract_distinct, populate};
use shelf_schema::retire::drop_legacy_column;
use shelf_schema::{
    DbConfig, Database, Inspector, Outcome, Pipeline, PipelineState, SchemaError, SchemaLayout,
    StepStatus, lock,
};

use common::*;

fn run(db: &Database) -> shelf_schema::MigrationSummary {
    Pipeline::new(db, SchemaLayout::default()).run().unwrap()
}

#[test]
fn normalizes_mixed_legacy_values() {
    let db = catalog(&[Some("Books"), Some("Toys"), Some(""), None, Some("Books")]);

    let summary = run(&db);

    assert_eq!(department_names(&db), vec!["Books", "Toys"]);
    assert_eq!(
        product_departments(&db),
        vec![
            (1, Some("Books".to_string())),
            (2, Some("Toys".to_string())),
            (3, None),
            (4, None),
            (5, Some("Books".to_string())),
        ]
    );
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.populate.inserted, 2);
    assert_eq!(summary.backfill.assigned, 3);
    assert!(summary.report.is_complete());
    assert_eq!(summary.report.reference_rows, Some(2));
    assert_eq!(summary.report.referenced_fact_rows, 3);
}

#[test]
fn retires_legacy_column_and_keeps_everything_else() {
    let db = catalog(&[Some("Books"), Some("Toys")]);

    run(&db);

    assert_eq!(
        columns(&db, "products"),
        vec![
            "id",
            "cost",
            "category",
            "name",
            "brand",
            "retail_price",
            "sku",
            "distribution_center_id",
            "department_id",
        ]
    );
    let fks: Vec<_> = Inspector::new(&db)
        .foreign_keys(&"products".parse().unwrap())
        .unwrap()
        .into_iter()
        .map(|fk| (fk.column, fk.referenced_table))
        .collect();
    assert!(fks.contains(&("distribution_center_id".into(), "distribution_centers".into())));
    assert!(fks.contains(&("department_id".into(), "departments".into())));

    let (name, sku): (String, String) = db
        .query_row("SELECT name, sku FROM products WHERE id = 2", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!((name.as_str(), sku.as_str()), ("Product 2", "SKU-2"));
}

#[test]
fn constraint_is_enforced_after_migration() {
    let db = catalog(&[Some("Books")]);
    run(&db);

    let err = db
        .execute("UPDATE products SET department_id = 999 WHERE id = 1", [])
        .unwrap_err();
    assert_eq!(
        shelf_schema::DbErrorKind::classify(&err),
        shelf_schema::DbErrorKind::IntegrityViolation
    );
}

#[test]
fn second_run_changes_nothing() {
    let db = catalog(&[Some("Books"), Some("Toys"), Some(""), None, Some("Books")]);

    run(&db);
    let after_first = state(&db);
    let second = run(&db);
    let after_second = state(&db);

    assert_eq!(after_first, after_second);
    assert!(
        second
            .steps
            .iter()
            .all(|step| step.outcome == Outcome::AlreadyApplied),
        "{:?}",
        second.steps
    );
    assert_eq!(
        second.steps.iter().map(|s| s.state).collect::<Vec<_>>(),
        PipelineState::STEPS.to_vec()
    );
}

#[test]
fn adding_reference_column_twice_is_a_no_op() {
    let db = catalog(&[Some("Books")]);
    let layout = SchemaLayout::default();
    let table = ensure_reference_table(&db, &layout).unwrap();

    let first = add_reference_column(&db, &layout, &table).unwrap();
    let second = add_reference_column(&db, &layout, &table).unwrap();

    assert_eq!(first.outcome(), Outcome::Applied);
    assert_eq!(second.outcome(), Outcome::AlreadyApplied);
    let occurrences = columns(&db, "products")
        .iter()
        .filter(|c| c.as_str() == "department_id")
        .count();
    assert_eq!(occurrences, 1);
}

#[test]
fn unresolved_reference_blocks_constraint_and_drop() {
    let db = catalog(&[Some("Books"), Some("Toys"), Some("Books")]);
    let layout = SchemaLayout::default();

    let table = ensure_reference_table(&db, &layout).unwrap();
    let values = extract_distinct(&db, &layout.fact_table, &layout.legacy_column).unwrap();
    let populated = populate(&db, &layout, &table, &values).unwrap();
    let column = add_reference_column(&db, &layout, &table).unwrap();
    let backfilled = backfill(&db, &layout, &populated, &column).unwrap();

    db.execute("DELETE FROM departments WHERE name = 'Toys'", [])
        .unwrap();
    let before = schema(&db);

    let err = add_constraint(&db, &layout, &backfilled).unwrap_err();
    match err {
        SchemaError::Integrity {
            orphaned,
            sample_ids,
            reference_table,
        } => {
            assert_eq!(orphaned, 1);
            assert_eq!(sample_ids, vec![2]);
            assert_eq!(reference_table, "departments");
        }
        other => panic!("expected integrity error, got {other:?}"),
    }

    assert_eq!(schema(&db), before);
    assert!(columns(&db, "products").contains(&"department".to_string()));
    let snapshot = Inspector::new(&db).snapshot(&layout).unwrap();
    assert!(!snapshot.foreign_key);
    assert!(snapshot.legacy_column);
}

#[test]
fn rerun_repairs_deleted_reference_row() {
    let db = catalog(&[Some("Books"), Some("Toys")]);
    let layout = SchemaLayout::default();

    let table = ensure_reference_table(&db, &layout).unwrap();
    let values = extract_distinct(&db, &layout.fact_table, &layout.legacy_column).unwrap();
    let populated = populate(&db, &layout, &table, &values).unwrap();
    let column = add_reference_column(&db, &layout, &table).unwrap();
    backfill(&db, &layout, &populated, &column).unwrap();
    db.execute("DELETE FROM departments WHERE name = 'Toys'", [])
        .unwrap();

    run(&db);

    assert_eq!(
        product_departments(&db),
        vec![(1, Some("Books".to_string())), (2, Some("Toys".to_string()))]
    );
}

#[test]
fn resumes_after_each_partial_state() {
    let legacy = [Some("Books"), Some("Toys"), None, Some("Games")];
    let layout = SchemaLayout::default();

    let reference = catalog(&legacy);
    run(&reference);
    let expected = product_departments(&reference);

    for stop_after in 0..=5 {
        let db = catalog(&legacy);
        let table = ensure_reference_table(&db, &layout).unwrap();
        if stop_after >= 1 {
            let values = extract_distinct(&db, &layout.fact_table, &layout.legacy_column).unwrap();
            let populated = populate(&db, &layout, &table, &values).unwrap();
            if stop_after >= 2 {
                let column = add_reference_column(&db, &layout, &table).unwrap();
                if stop_after >= 3 {
                    let backfilled = backfill(&db, &layout, &populated, &column).unwrap();
                    if stop_after >= 4 {
                        let constrained = add_constraint(&db, &layout, &backfilled).unwrap();
                        if stop_after >= 5 {
                            drop_legacy_column(&db, &layout, &constrained).unwrap();
                        }
                    }
                }
            }
        }

        let summary = run(&db);
        assert!(summary.report.is_complete(), "stopped after {stop_after}");
        assert_eq!(product_departments(&db), expected, "stopped after {stop_after}");
    }
}

#[test]
fn backfill_corrects_stale_references() {
    let db = catalog(&[Some("Books"), Some("Toys"), None, Some("")]);
    let layout = SchemaLayout::default();

    let table = ensure_reference_table(&db, &layout).unwrap();
    let values = extract_distinct(&db, &layout.fact_table, &layout.legacy_column).unwrap();
    let populated = populate(&db, &layout, &table, &values).unwrap();
    let column = add_reference_column(&db, &layout, &table).unwrap();

    // Books=1, Toys=2; point everything at the wrong row.
    db.execute("UPDATE products SET department_id = 2 WHERE id IN (1, 3, 4)", [])
        .unwrap();
    db.execute("UPDATE products SET department_id = 1 WHERE id = 2", [])
        .unwrap();

    let backfilled = backfill(&db, &layout, &populated, &column).unwrap();
    assert_eq!(backfilled.summary().assigned, 2);
    assert_eq!(backfilled.summary().cleared, 2);
    assert_eq!(
        product_reference_ids(&db),
        vec![(1, Some(1)), (2, Some(2)), (3, None), (4, None)]
    );

    let again = backfill(&db, &layout, &populated, &column).unwrap();
    assert_eq!(again.outcome(), Outcome::AlreadyApplied);
}

#[test]
fn matching_is_exact_and_case_sensitive() {
    let db = catalog(&[Some("Books"), Some("books"), Some(" Books")]);

    run(&db);

    assert_eq!(department_names(&db), vec![" Books", "Books", "books"]);
    let ids: Vec<_> = product_reference_ids(&db)
        .into_iter()
        .map(|(_, id)| id.unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);
}

#[test]
fn only_empty_legacy_values_still_completes() {
    let db = catalog(&[None, Some("")]);

    let summary = run(&db);

    assert_eq!(summary.report.reference_rows, Some(0));
    assert!(summary.report.is_complete());
    assert_eq!(product_reference_ids(&db), vec![(1, None), (2, None)]);
}

#[test]
fn drops_indexes_on_legacy_column() {
    let db = catalog(&[Some("Books")]);
    db.execute_batch(
        "CREATE INDEX idx_products_department ON products(department);
         CREATE INDEX idx_products_sku ON products(sku);",
    )
    .unwrap();

    run(&db);

    let names: Vec<String> = schema(&db)
        .into_iter()
        .filter(|(kind, _, _)| kind == "index")
        .map(|(_, name, _)| name)
        .collect();
    assert!(names.contains(&"idx_products_sku".to_string()));
    assert!(!names.contains(&"idx_products_department".to_string()));
}

#[test]
fn keeps_triggers_on_fact_table() {
    let db = catalog(&[Some("Books"), Some("Toys")]);
    db.execute_batch(
        "CREATE TABLE price_audit (product_id INTEGER, retail_price REAL);
         CREATE TRIGGER products_audit AFTER UPDATE OF retail_price ON products
         BEGIN INSERT INTO price_audit VALUES (new.id, new.retail_price); END;",
    )
    .unwrap();

    run(&db);

    let triggers: Vec<String> = schema(&db)
        .into_iter()
        .filter(|(kind, _, _)| kind == "trigger")
        .map(|(_, name, _)| name)
        .collect();
    assert_eq!(triggers, vec!["products_audit"]);

    db.execute("UPDATE products SET retail_price = 9.5 WHERE id = 2", [])
        .unwrap();
    let audited: (i64, f64) = db
        .query_row("SELECT product_id, retail_price FROM price_audit", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(audited, (2, 9.5));
}

#[test]
fn keeps_views_over_fact_table() {
    let db = catalog(&[Some("Books"), Some("Toys")]);
    db.execute_batch(
        "UPDATE products SET retail_price = 20.0 WHERE id = 2;
         CREATE VIEW cheap AS SELECT id, name FROM products WHERE retail_price < 10;",
    )
    .unwrap();

    let summary = run(&db);
    assert!(summary.report.is_complete());

    let cheap: Vec<(i64, String)> = {
        let mut stmt = db.prepare("SELECT id, name FROM cheap ORDER BY id").unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    };
    assert_eq!(cheap, vec![(1, "Product 1".to_string())]);

    let before = state(&db);
    run(&db);
    assert_eq!(state(&db), before);
}

#[test]
fn held_lock_stops_run_before_any_change() {
    let db = catalog(&[Some("Books")]);
    let layout = SchemaLayout::default();
    let _held = lock::acquire(&db, &layout.lock_name(), lock::DEFAULT_LOCK_TTL).unwrap();
    let before = schema(&db);

    let err = Pipeline::new(&db, layout).run().unwrap_err();

    assert_eq!(err.reached, PipelineState::Start);
    assert!(matches!(err.source, SchemaError::LockHeld { .. }));
    assert_eq!(schema(&db), before);
}

#[test]
fn lock_is_released_after_failure() {
    let db = catalog(&[Some("Books")]);
    let layout = SchemaLayout::default();
    db.execute_batch(
        "CREATE TABLE departments (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
         CREATE TRIGGER no_inserts BEFORE INSERT ON departments BEGIN SELECT RAISE(ABORT, 'frozen'); END;",
    )
    .unwrap();

    let err = Pipeline::new(&db, layout.clone()).run().unwrap_err();
    assert_eq!(err.reached, PipelineState::ValuesExtracted);
    assert!(lock::current_holder(&db, &layout.lock_name()).unwrap().is_none());
}

#[test]
fn reports_progress_in_order() {
    let db = catalog(&[Some("Books")]);
    let mut seen = Vec::new();

    Pipeline::new(&db, SchemaLayout::default())
        .on_progress(|step| seen.push(step.state))
        .run()
        .unwrap();

    assert_eq!(seen, PipelineState::STEPS.to_vec());
}

#[test]
fn plan_reports_pending_steps_without_changing_anything() {
    let db = catalog(&[Some("Books"), None]);
    let pipeline = Pipeline::new(&db, SchemaLayout::default());
    let before = schema(&db);

    let plan = pipeline.plan().unwrap();

    assert_eq!(schema(&db), before);
    assert_eq!(plan.len(), PipelineState::STEPS.len());
    assert!(plan.iter().all(|step| step.status == StepStatus::Pending));
}

#[test]
fn plan_after_migration_is_all_done() {
    let db = catalog(&[Some("Books"), None]);
    run(&db);

    let plan = Pipeline::new(&db, SchemaLayout::default()).plan().unwrap();

    assert!(
        plan.iter().all(|step| step.status == StepStatus::Done),
        "{plan:?}"
    );
}

#[test]
fn plan_sees_partial_progress() {
    let db = catalog(&[Some("Books")]);
    let layout = SchemaLayout::default();
    let table = ensure_reference_table(&db, &layout).unwrap();
    add_reference_column(&db, &layout, &table).unwrap();

    let plan = Pipeline::new(&db, layout).plan().unwrap();
    let status: Vec<_> = plan.iter().map(|s| (s.state, s.status)).collect();

    assert_eq!(
        status,
        vec![
            (PipelineState::TableCreated, StepStatus::Done),
            (PipelineState::ValuesExtracted, StepStatus::Pending),
            (PipelineState::TablePopulated, StepStatus::Pending),
            (PipelineState::ColumnAdded, StepStatus::Done),
            (PipelineState::Backfilled, StepStatus::Pending),
            (PipelineState::Constrained, StepStatus::Pending),
            (PipelineState::LegacyDropped, StepStatus::Pending),
        ]
    );
}

#[test]
fn survives_reopening_the_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = DbConfig::new(dir.path().join("catalog.db"));
    {
        let db = Database::open(&config).unwrap();
        db.execute_batch(CATALOG_SCHEMA).unwrap();
        db.execute(
            "INSERT INTO products (id, name, department, distribution_center_id) VALUES (1, 'Atlas', 'Books', 1)",
            [],
        )
        .unwrap();
        run(&db);
    }

    let db = Database::open(&config).unwrap();
    let summary = run(&db);
    assert!(summary.report.is_complete());
    assert_eq!(product_departments(&db), vec![(1, Some("Books".to_string()))]);
}
