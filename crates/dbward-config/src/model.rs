use std::path::PathBuf;
use std::time::Duration;

use dbward_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for `lock.lease_secs` (one week).
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration for a dbward invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbWardConfig {
    /// Cluster or namespace the target database lives in.
    pub namespace: String,
    pub database: String,
    /// Recorded as `applied_by` on migrations and as the backup creator.
    pub user: String,
    pub data_dir: PathBuf,
    /// Explicit database file; derived from `data_dir` when unset.
    pub database_path: Option<PathBuf>,
    pub migrations_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub keep_count: usize,
    pub lock: LockConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub name: String,
    /// Seconds a lock row stays valid without renewal.
    pub lease_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

impl Default for DbWardConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            database: "app".to_string(),
            user: std::env::var("USER")
                .ok()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| "dbward".to_string()),
            data_dir: PathBuf::from("data"),
            database_path: None,
            migrations_dir: PathBuf::from("migrations"),
            backup_dir: PathBuf::from("backups"),
            keep_count: 10,
            lock: LockConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "schema_migrations".to_string(),
            lease_secs: 900,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_ms: 1000,
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl DbWardConfig {
    /// Resolved path of the target database file.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => self
                .data_dir
                .join(&self.namespace)
                .join(format!("{}.sqlite3", self.database)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("database", &self.database),
            ("user", &self.user),
            ("lock.name", &self.lock.name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} cannot be empty")));
            }
        }
        if self.namespace.contains(['/', '\\']) || self.database.contains(['/', '\\']) {
            return Err(Error::Config(
                "namespace and database must not contain path separators".into(),
            ));
        }
        if self.keep_count == 0 {
            return Err(Error::Config("keep_count must be at least 1".into()));
        }
        if self.lock.lease_secs == 0 || self.lock.lease_secs > MAX_LEASE_SECS {
            return Err(Error::Config(format!(
                "lock.lease_secs must be between 1 and {MAX_LEASE_SECS}"
            )));
        }
        if self.readiness.interval_ms == 0 {
            return Err(Error::Config(
                "readiness.interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
