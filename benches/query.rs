//! Query Execution Performance Benchmarks
//!
//! `SQLite`-backed benchmarks of the execution path:
//! - Simple and filtered SELECT
//! - Large result sets capped by `max_rows`
//! - Table introspection

use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[cfg(feature = "sqlite")]
use sqlgate::{engine::sqlite::SqliteConnector, ConnectOptions, Connector, ExecuteOptions};

#[cfg(feature = "sqlite")]
fn seeded_connector(runtime: &tokio::runtime::Runtime) -> SqliteConnector {
    let connector = SqliteConnector::new();
    let options = ConnectOptions {
        init_script: Some(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 5000)
             INSERT INTO users (name, age) SELECT 'User ' || i, i % 90 FROM n;
             CREATE INDEX idx_users_age ON users(age);"
                .to_string(),
        ),
        ..Default::default()
    };
    runtime.block_on(connector.connect("sqlite::memory:", &options)).expect("Failed to connect");
    connector
}

#[cfg(feature = "sqlite")]
fn bench_sqlite_select(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let connector = seeded_connector(&runtime);
    let options = ExecuteOptions::read_only().with_max_rows(100);

    c.bench_function("sqlite_select_capped", |b| {
        b.iter(|| {
            let result = runtime
                .block_on(connector.execute_query(black_box("SELECT * FROM users"), black_box(&options)));
            assert!(result.is_ok());
            result
        });
    });

    c.bench_function("sqlite_select_filtered", |b| {
        b.iter(|| {
            runtime.block_on(connector.execute_query(
                black_box("SELECT id, name FROM users WHERE age = 42"),
                black_box(&options),
            ))
        });
    });

    let unbounded = ExecuteOptions::read_only();
    c.bench_function("sqlite_select_5000_rows", |b| {
        b.iter(|| runtime.block_on(connector.execute_query(black_box("SELECT * FROM users"), &unbounded)));
    });
}

#[cfg(feature = "sqlite")]
fn bench_sqlite_introspection(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let connector = seeded_connector(&runtime);

    c.bench_function("sqlite_table_schema", |b| {
        b.iter(|| runtime.block_on(connector.get_table_schema(black_box("users"), None)));
    });

    c.bench_function("sqlite_table_indexes", |b| {
        b.iter(|| runtime.block_on(connector.get_table_indexes(black_box("users"), None)));
    });
}

#[cfg(feature = "sqlite")]
criterion_group!(benches, bench_sqlite_select, bench_sqlite_introspection);

#[cfg(not(feature = "sqlite"))]
criterion_group!(benches,);

criterion_main!(benches);
