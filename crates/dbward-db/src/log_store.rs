use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dbward_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// One attempt to apply a migration version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Durable record of applied migrations.
///
/// `record` must refuse to overwrite a successful record; a failed record
/// is replaced by the next attempt of the same version.
pub trait MigrationLogStore {
    /// All records, ascending by version.
    fn records(&self) -> Result<Vec<MigrationRecord>>;

    fn record(&self, record: &MigrationRecord) -> Result<()>;
}

pub(crate) fn already_applied(version: &str) -> Error {
    Error::Integrity(format!(
        "migration {version} is already recorded as applied and cannot be rewritten"
    ))
}

#[derive(Default)]
pub struct MemoryLogStore {
    records: Mutex<BTreeMap<String, MigrationRecord>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MigrationLogStore for MemoryLogStore {
    fn records(&self) -> Result<Vec<MigrationRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Database("migration log lock poisoned".into()))?;
        Ok(records.values().cloned().collect())
    }

    fn record(&self, record: &MigrationRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Database("migration log lock poisoned".into()))?;
        if records.get(&record.version).is_some_and(|r| r.success) {
            return Err(already_applied(&record.version));
        }
        records.insert(record.version.clone(), record.clone());
        Ok(())
    }
}
