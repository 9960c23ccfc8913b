use std::time::{Duration, Instant};

use chrono::Utc;
use dbward_common::{Error, Result};
use tracing::{error, info, warn};

use crate::catalog::{MigrationFileSource, MigrationUnit, PendingSet, compute_pending};
use crate::lock::{LockGuard, LockHolder, LockInfo, LockStore};
use crate::log_store::{MigrationLogStore, MigrationRecord};

pub const DEFAULT_LOCK_NAME: &str = "schema_migrations";
pub const DEFAULT_LEASE: Duration = Duration::from_secs(900);

/// Store that migration statements run against.
pub trait MigrationTarget {
    /// Run every statement of `unit` inside one transaction. On failure the
    /// transaction is rolled back and [`Error::MigrationExecution`] names the
    /// offending statement.
    fn apply(&self, unit: &MigrationUnit) -> Result<()>;
}

/// Snapshot of catalog vs. log, as shown by `status`.
#[derive(Debug, Default)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    pub failed: Vec<MigrationRecord>,
    pub pending: Vec<String>,
    pub orphans: Vec<String>,
    pub drifted: Vec<String>,
    pub lock: Option<LockInfo>,
}

/// Outcome of a successful `migrate` run.
#[derive(Debug, Default, PartialEq)]
pub struct RunReport {
    pub applied: Vec<String>,
    /// Pending versions left alone because they sort after the target.
    pub held_back: Vec<String>,
}

pub struct Migrator<'a> {
    source: &'a dyn MigrationFileSource,
    log: &'a dyn MigrationLogStore,
    locks: &'a dyn LockStore,
    target: &'a dyn MigrationTarget,
    user: String,
    lock_name: String,
    lease: Duration,
}

impl<'a> Migrator<'a> {
    pub fn new(
        source: &'a dyn MigrationFileSource,
        log: &'a dyn MigrationLogStore,
        locks: &'a dyn LockStore,
        target: &'a dyn MigrationTarget,
        user: impl Into<String>,
    ) -> Self {
        Self {
            source,
            log,
            locks,
            target,
            user: user.into(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lock(mut self, lock_name: impl Into<String>, lease: Duration) -> Self {
        self.lock_name = lock_name.into();
        self.lease = lease;
        self
    }

    fn plan(&self) -> Result<(PendingSet, Vec<MigrationRecord>)> {
        let records = self.log.records()?;
        let set = compute_pending(self.source.units()?, &records)?;
        for orphan in &set.orphans {
            warn!("migration {orphan} is recorded in the log but has no file");
        }
        Ok((set, records))
    }

    pub fn status(&self) -> Result<MigrationStatus> {
        let (set, records) = self.plan()?;
        for version in &set.drifted {
            warn!("migration {version} changed on disk after it was applied");
        }
        let (applied, failed): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.success);
        Ok(MigrationStatus {
            applied,
            failed,
            pending: set.pending.into_iter().map(|u| u.version).collect(),
            orphans: set.orphans,
            drifted: set.drifted,
            lock: self.locks.current(&self.lock_name)?,
        })
    }

    /// Apply pending migrations in version order, stopping at the first
    /// failure. With `target_version`, versions sorting after it are left
    /// pending.
    pub fn migrate(&self, target_version: Option<&str>) -> Result<RunReport> {
        let guard = LockGuard::acquire(
            self.locks,
            &self.lock_name,
            LockHolder::current(&self.user),
            self.lease,
        )?;

        let (set, _) = self.plan()?;
        if !set.drifted.is_empty() {
            return Err(Error::Integrity(format!(
                "applied migrations changed on disk: {}; restore the original files before migrating",
                set.drifted.join(", ")
            )));
        }

        if let Some(target) = target_version
            && !set.pending.iter().any(|u| u.version == target)
        {
            warn!("target version {target} is not a pending migration");
        }
        let (to_apply, held_back): (Vec<_>, Vec<_>) = set
            .pending
            .into_iter()
            .partition(|u| target_version.is_none_or(|t| u.version.as_str() <= t));

        let mut report = RunReport {
            held_back: held_back.into_iter().map(|u| u.version).collect(),
            ..Default::default()
        };
        if to_apply.is_empty() {
            info!("no pending migrations");
        }

        for unit in &to_apply {
            self.apply_one(unit)?;
            report.applied.push(unit.version.clone());
            guard.renew()?;
        }

        guard.release()?;
        info!(
            "applied {} migration(s), {} held back",
            report.applied.len(),
            report.held_back.len()
        );
        Ok(report)
    }

    fn apply_one(&self, unit: &MigrationUnit) -> Result<()> {
        info!("applying migration {}", unit.version);
        let applied_at = Utc::now();
        let timer = Instant::now();
        let outcome = self.target.apply(unit);
        let execution_time_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error_message = outcome.as_ref().err().map(|e| match e {
            Error::MigrationExecution { message, .. } => message.clone(),
            other => other.to_string(),
        });
        let record = MigrationRecord {
            version: unit.version.clone(),
            name: unit.name.clone(),
            checksum: unit.checksum(),
            applied_at,
            applied_by: self.user.clone(),
            execution_time_ms,
            success: outcome.is_ok(),
            error_message,
        };

        let logged = self.log.record(&record);
        if let Err(e) = outcome {
            error!("migration {} failed: {e}", unit.version);
            if let Err(log_err) = logged {
                error!("could not record failure of {}: {log_err}", unit.version);
            }
            return Err(e);
        }
        logged?;
        info!("applied {} in {execution_time_ms}ms", unit.version);
        Ok(())
    }
}
