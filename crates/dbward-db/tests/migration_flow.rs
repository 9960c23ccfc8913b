use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use dbward_common::Error;
use dbward_db::{
    DirectorySource, LockStore, MigrationLogStore, MigrationTarget, MigrationUnit, Migrator,
    SqliteStore,
};

fn write_migration(dir: &Path, version: &str, sql: &str) {
    std::fs::write(dir.join(format!("{version}.sql")), sql).unwrap();
}

#[test]
fn init_then_add_column_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    write_migration(
        &migrations,
        "20240101_0000_init",
        "BEGIN;\nCREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\nCOMMIT;\n",
    );
    write_migration(
        &migrations,
        "20240102_0000_add_col",
        "BEGIN;\nALTER TABLE t ADD COLUMN email TEXT;\nCOMMIT;\n",
    );

    let store = SqliteStore::open(&dir.path().join("app.sqlite3")).unwrap();
    let source = DirectorySource::new(&migrations);
    let migrator = Migrator::new(&source, &store, &store, &store, "tester");

    let report = migrator.migrate(None).unwrap();
    assert_eq!(report.applied, vec!["20240101_0000_init", "20240102_0000_add_col"]);

    let status = migrator.status().unwrap();
    assert_eq!(status.pending.len(), 0);
    assert_eq!(status.applied.len(), 2);
    assert_eq!(status.failed.len(), 0);
    assert!(status.lock.is_none());

    let email_columns: i64 = store
        .query_scalar("SELECT count(*) FROM pragma_table_info('t') WHERE name = 'email'")
        .unwrap();
    assert_eq!(email_columns, 1);

    // Nothing new in the catalog: a second run is a no-op.
    assert!(migrator.migrate(None).unwrap().applied.is_empty());
}

#[test]
fn failing_unit_halts_and_is_retried_after_fix() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    write_migration(&migrations, "20240101_0000_v1", "CREATE TABLE a (id INTEGER);");
    write_migration(
        &migrations,
        "20240102_0000_v2",
        "CREATE TABLE b (id INTEGER);\nINSERT INTO nope VALUES (1);",
    );
    write_migration(&migrations, "20240103_0000_v3", "CREATE TABLE c (id INTEGER);");

    let store = SqliteStore::open(&dir.path().join("app.sqlite3")).unwrap();
    let source = DirectorySource::new(&migrations);
    let migrator = Migrator::new(&source, &store, &store, &store, "tester");

    match migrator.migrate(None) {
        Err(Error::MigrationExecution {
            version, statement, ..
        }) => {
            assert_eq!(version, "20240102_0000_v2");
            assert_eq!(statement, "INSERT INTO nope VALUES (1)");
        }
        other => panic!("expected execution failure, got {other:?}"),
    }

    let records = store.records().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].success);
    assert!(!records[1].success);
    assert!(records[1].error_message.as_deref().unwrap().contains("nope"));

    let table_exists = |name: &str| -> i64 {
        store
            .query_scalar(&format!(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = '{name}'"
            ))
            .unwrap()
    };
    assert_eq!(table_exists("a"), 1);
    assert_eq!(table_exists("b"), 0, "failed unit must roll back entirely");
    assert_eq!(table_exists("c"), 0, "units after a failure are never attempted");
    assert!(store.current("schema_migrations").unwrap().is_none());

    write_migration(&migrations, "20240102_0000_v2", "CREATE TABLE b (id INTEGER);");
    let report = migrator.migrate(None).unwrap();
    assert_eq!(report.applied, vec!["20240102_0000_v2", "20240103_0000_v3"]);
    assert_eq!(table_exists("b"), 1);
    assert_eq!(table_exists("c"), 1);
    assert!(store.records().unwrap().iter().all(|r| r.success));
}

/// Delegates to the real store but holds each unit open for a while so two
/// runs are guaranteed to overlap.
struct SlowTarget<'a> {
    store: &'a SqliteStore,
    applied: &'a AtomicUsize,
}

impl MigrationTarget for SlowTarget<'_> {
    fn apply(&self, unit: &MigrationUnit) -> dbward_common::Result<()> {
        std::thread::sleep(Duration::from_millis(300));
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.store.apply(unit)
    }
}

#[test]
fn concurrent_runs_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    write_migration(&migrations, "20240101_0000_a", "CREATE TABLE a (id INTEGER);");
    write_migration(&migrations, "20240102_0000_b", "CREATE TABLE b (id INTEGER);");

    let db_path = dir.path().join("app.sqlite3");
    SqliteStore::open(&db_path).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let applied = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let applied = Arc::clone(&applied);
            let db_path = db_path.clone();
            let migrations = migrations.clone();
            std::thread::spawn(move || {
                let store = SqliteStore::open_existing(&db_path).unwrap();
                let source = DirectorySource::new(&migrations);
                let target = SlowTarget {
                    store: &store,
                    applied: &applied,
                };
                let migrator =
                    Migrator::new(&source, &store, &store, &target, format!("operator-{i}"));
                barrier.wait();
                migrator.migrate(None).map(|report| report.applied)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    let losers: Vec<_> = results
        .iter()
        .filter(|r| matches!(r, Err(Error::LockContention { .. })))
        .collect();
    assert_eq!(winners.len(), 1, "results: {results:?}");
    assert_eq!(losers.len(), 1, "results: {results:?}");
    assert_eq!(applied.load(Ordering::SeqCst), 2, "loser applied nothing");

    let store = SqliteStore::open_existing(&db_path).unwrap();
    assert_eq!(store.records().unwrap().len(), 2);
}
