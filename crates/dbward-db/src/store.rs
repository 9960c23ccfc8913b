use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dbward_common::{Error, Result};
use rusqlite::types::FromSql;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::backup::SnapshotStore;
use crate::catalog::MigrationUnit;
use crate::dump;
use crate::lock::{LockHolder, LockInfo, LockStore, lease_expiry};
use crate::log_store::{MigrationLogStore, MigrationRecord, already_applied};
use crate::runner::MigrationTarget;

pub const LOG_TABLE: &str = "schema_migrations";
pub const LOCK_TABLE: &str = "schema_migration_lock";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const BOOKKEEPING_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        checksum TEXT NOT NULL,
        applied_at TEXT NOT NULL,
        applied_by TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL DEFAULT 0,
        success INTEGER NOT NULL,
        error_message TEXT
    );

    CREATE TABLE IF NOT EXISTS schema_migration_lock (
        lock_name TEXT PRIMARY KEY,
        locked_at TEXT NOT NULL,
        locked_by TEXT NOT NULL,
        pid INTEGER NOT NULL,
        holder_token TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );";

/// Connection to the target SQLite database. Also hosts the migration log
/// and the migration lock tables.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and make sure the
    /// bookkeeping tables exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        let store = Self::configure(conn, Some(db_path.to_path_buf()))?;
        store.initialize()?;
        Ok(store)
    }

    /// Open an existing database without creating it or touching its schema.
    pub fn open_existing(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(Error::Connectivity(format!(
                "database not found at {}",
                db_path.display()
            )));
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags).map_err(|e| {
            Error::Connectivity(format!("failed to open {}: {e}", db_path.display()))
        })?;
        Self::configure(conn, Some(db_path.to_path_buf()))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self::configure(conn, None)?;
        store.initialize()?;
        Ok(store)
    }

    fn configure(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database connection lock poisoned".into()))
    }

    /// Trivial round trip used by the readiness probe.
    pub fn ping(&self) -> Result<()> {
        let conn = self.connection()?;
        let one: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(|e| Error::Connectivity(format!("database did not answer: {e}")))?;
        if one != 1 {
            return Err(Error::Connectivity(format!(
                "unexpected probe result {one}"
            )));
        }
        Ok(())
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql)
            .map_err(|e| Error::Database(format!("statement failed: {e}")))
    }

    pub fn query_scalar<T: FromSql>(&self, sql: &str) -> Result<T> {
        let conn = self.connection()?;
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("query failed: {e}")))
    }
}

impl MigrationLogStore for SqliteStore {
    fn records(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT version, name, checksum, applied_at, applied_by,
                        execution_time_ms, success, error_message
                 FROM schema_migrations
                 ORDER BY version ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    applied_at: parse_datetime(row.get::<_, String>(3)?),
                    applied_by: row.get(4)?,
                    execution_time_ms: u64::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
                    success: row.get(6)?,
                    error_message: row.get(7)?,
                })
            })
            .map_err(|e| Error::Database(format!("failed to query migration log: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read migration record: {e}")))
    }

    fn record(&self, record: &MigrationRecord) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "INSERT INTO schema_migrations
                    (version, name, checksum, applied_at, applied_by,
                     execution_time_ms, success, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(version) DO UPDATE SET
                    name = excluded.name,
                    checksum = excluded.checksum,
                    applied_at = excluded.applied_at,
                    applied_by = excluded.applied_by,
                    execution_time_ms = excluded.execution_time_ms,
                    success = excluded.success,
                    error_message = excluded.error_message
                 WHERE schema_migrations.success = 0",
                params![
                    record.version,
                    record.name,
                    record.checksum,
                    format_datetime(record.applied_at),
                    record.applied_by,
                    i64::try_from(record.execution_time_ms).unwrap_or(i64::MAX),
                    record.success,
                    record.error_message,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to write migration record: {e}")))?;
        if changed == 0 {
            return Err(already_applied(&record.version));
        }
        Ok(())
    }
}

impl LockStore for SqliteStore {
    fn try_acquire(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<()> {
        let conn = self.connection()?;
        let now = Utc::now();
        let previous = read_lock(&conn, lock_name)?;

        // Insert-if-absent, or take over a row whose lease ran out. SQLite
        // runs the statement atomically, so two contenders cannot both win.
        let changed = conn
            .execute(
                "INSERT INTO schema_migration_lock
                    (lock_name, locked_at, locked_by, pid, holder_token, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(lock_name) DO UPDATE SET
                    locked_at = excluded.locked_at,
                    locked_by = excluded.locked_by,
                    pid = excluded.pid,
                    holder_token = excluded.holder_token,
                    expires_at = excluded.expires_at
                 WHERE schema_migration_lock.expires_at < excluded.locked_at",
                params![
                    lock_name,
                    format_datetime(now),
                    holder.locked_by,
                    i64::from(holder.pid),
                    holder.token,
                    format_datetime(lease_expiry(now, lease)),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to acquire lock: {e}")))?;

        if changed == 0 {
            return match read_lock(&conn, lock_name)? {
                Some(current) => Err(current.contention()),
                None => Err(Error::Database(format!(
                    "lock '{lock_name}' changed hands during acquisition"
                ))),
            };
        }
        if let Some(previous) = previous
            && previous.token != holder.token
        {
            warn!(
                "took over expired lock '{lock_name}' from {} (pid {}, expired {})",
                previous.locked_by,
                previous.pid,
                previous.expires_at.to_rfc3339()
            );
        }
        Ok(())
    }

    fn renew(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE schema_migration_lock SET expires_at = ?1
                 WHERE lock_name = ?2 AND holder_token = ?3",
                params![
                    format_datetime(lease_expiry(Utc::now(), lease)),
                    lock_name,
                    holder.token
                ],
            )
            .map_err(|e| Error::Database(format!("failed to renew lock: {e}")))?;
        Ok(changed == 1)
    }

    fn release(&self, lock_name: &str, holder: &LockHolder) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "DELETE FROM schema_migration_lock WHERE lock_name = ?1 AND holder_token = ?2",
                params![lock_name, holder.token],
            )
            .map_err(|e| Error::Database(format!("failed to release lock: {e}")))?;
        if changed == 0 {
            debug!("lock '{lock_name}' was not held by this process at release");
        }
        Ok(())
    }

    fn force_release(&self, lock_name: &str) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "DELETE FROM schema_migration_lock WHERE lock_name = ?1",
                params![lock_name],
            )
            .map_err(|e| Error::Database(format!("failed to clear lock: {e}")))?;
        Ok(changed > 0)
    }

    fn current(&self, lock_name: &str) -> Result<Option<LockInfo>> {
        let conn = self.connection()?;
        read_lock(&conn, lock_name)
    }
}

fn read_lock(conn: &Connection, lock_name: &str) -> Result<Option<LockInfo>> {
    conn.query_row(
        "SELECT lock_name, locked_at, locked_by, pid, holder_token, expires_at
         FROM schema_migration_lock WHERE lock_name = ?1",
        params![lock_name],
        |row| {
            Ok(LockInfo {
                lock_name: row.get(0)?,
                locked_at: parse_datetime(row.get::<_, String>(1)?),
                locked_by: row.get(2)?,
                pid: u32::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                token: row.get(4)?,
                expires_at: parse_datetime(row.get::<_, String>(5)?),
            })
        },
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to read lock: {e}")))
}

impl MigrationTarget for SqliteStore {
    fn apply(&self, unit: &MigrationUnit) -> Result<()> {
        let statements = unit.statements();
        let failure = |statement: &str, e: rusqlite::Error| Error::MigrationExecution {
            version: unit.version.clone(),
            statement: statement.to_string(),
            message: e.to_string(),
        };

        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(|e| failure("BEGIN", e))?;
        for statement in &statements {
            debug!("{}: {statement}", unit.version);
            // Dropping `tx` on the error path rolls the whole unit back.
            tx.execute_batch(statement)
                .map_err(|e| failure(statement.as_str(), e))?;
        }
        tx.commit().map_err(|e| failure("COMMIT", e))
    }
}

impl SnapshotStore for SqliteStore {
    fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let conn = self.connection()?;
        // A read transaction keeps the dump consistent against other writers.
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Database(format!("failed to start dump: {e}")))?;
        dump::write_dump(&tx, out, LOCK_TABLE)
    }

    fn restore(&self, dump: &mut dyn BufRead) -> Result<()> {
        let mut conn = self.connection()?;
        with_foreign_keys_off(&mut conn, |tx| {
            dump::drop_user_objects(tx, LOCK_TABLE)?;
            let loaded = dump::load_dump(tx, dump)?;
            debug!("loaded {loaded} dump statements");
            tx.execute_batch(BOOKKEEPING_SCHEMA)
                .map_err(|e| Error::Database(format!("failed to recreate bookkeeping: {e}")))
        })
    }

    fn reset_schema(&self) -> Result<()> {
        let mut conn = self.connection()?;
        with_foreign_keys_off(&mut conn, |tx| dump::drop_user_objects(tx, LOCK_TABLE))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(BOOKKEEPING_SCHEMA)
            .map_err(|e| Error::Database(format!("failed to create bookkeeping tables: {e}")))
    }
}

/// Run `f` in a transaction with foreign key enforcement suspended, so
/// tables can be dropped and reloaded in any order.
fn with_foreign_keys_off<F>(conn: &mut Connection, f: F) -> Result<()>
where
    F: FnOnce(&Connection) -> Result<()>,
{
    conn.execute_batch("PRAGMA foreign_keys=OFF")
        .map_err(|e| Error::Database(format!("failed to disable foreign keys: {e}")))?;

    let outcome = (|| {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        f(&tx)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit: {e}")))
    })();

    conn.execute_batch("PRAGMA foreign_keys=ON")
        .map_err(|e| Error::Database(format!("failed to re-enable foreign keys: {e}")))?;
    outcome
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // Rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS".
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        })
}
