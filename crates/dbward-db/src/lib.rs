//! Migration and backup/restore engine.
//!
//! The target database is reached through [`SqliteStore`], which also backs
//! the migration log and the migration lock. The runner and the backup
//! engine only see the narrow traits ([`MigrationFileSource`],
//! [`MigrationLogStore`], [`LockStore`], [`MigrationTarget`],
//! [`SnapshotStore`]) so they can be driven by in-memory fakes.

pub mod backup;
pub mod catalog;
mod dump;
pub mod lock;
pub mod log_store;
pub mod readiness;
pub mod runner;
pub mod store;

pub use backup::{
    BackupEngine, BackupMetadata, BackupOptions, Confirm, ConfirmationRequest,
    RESET_CONFIRMATION, RESTORE_CONFIRMATION, RestoreReport, SnapshotStore,
};
pub use catalog::{
    DirectorySource, MemorySource, MigrationFileSource, MigrationUnit, PendingSet,
    compute_pending, generate_migration,
};
pub use lock::{LockGuard, LockHolder, LockInfo, LockStore, MemoryLockStore};
pub use log_store::{MemoryLogStore, MigrationLogStore, MigrationRecord};
pub use readiness::{DatabaseLocator, FileLocator, ReadinessChecker};
pub use runner::{MigrationStatus, MigrationTarget, Migrator, RunReport};
pub use store::{LOCK_TABLE, LOG_TABLE, SqliteStore};
