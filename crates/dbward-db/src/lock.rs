use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dbward_common::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of the process that wants (or holds) a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// `user@host`.
    pub locked_by: String,
    pub pid: u32,
    /// Distinguishes two holders that share user, host and pid.
    pub token: String,
}

impl LockHolder {
    pub fn current(user: &str) -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            locked_by: format!("{user}@{host}"),
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// A lock row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub lock_name: String,
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
    pub pid: u32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub(crate) fn contention(&self) -> Error {
        Error::LockContention {
            lock_name: self.lock_name.clone(),
            holder: self.locked_by.clone(),
            pid: self.pid,
            locked_at: self.locked_at,
        }
    }
}

/// Durable mutual exclusion across processes.
///
/// `try_acquire` must be a single atomic insert-if-absent: it succeeds when
/// no row exists or the existing row's lease has expired, and otherwise
/// fails with [`Error::LockContention`].
pub trait LockStore {
    fn try_acquire(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<()>;

    /// Extend the lease. Returns `false` if `holder` no longer owns the lock.
    fn renew(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<bool>;

    /// Delete the row if `holder` still owns it.
    fn release(&self, lock_name: &str, holder: &LockHolder) -> Result<()>;

    /// Delete the row whoever owns it. Returns whether a row existed.
    fn force_release(&self, lock_name: &str) -> Result<bool>;

    fn current(&self, lock_name: &str) -> Result<Option<LockInfo>>;
}

/// Longest lease a lock row is given. Longer requests are shortened so
/// expiry timestamps stay in the four-digit-year range that orders
/// correctly as text.
pub const MAX_LEASE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    if lease > MAX_LEASE {
        debug!("lease of {}s capped to {}s", lease.as_secs(), MAX_LEASE.as_secs());
    }
    let lease = chrono::Duration::from_std(lease.min(MAX_LEASE)).unwrap_or(chrono::Duration::zero());
    now.checked_add_signed(lease).unwrap_or(now)
}

/// Holds a lock until dropped or explicitly released.
pub struct LockGuard<'a> {
    store: &'a dyn LockStore,
    lock_name: String,
    holder: LockHolder,
    lease: Duration,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(
        store: &'a dyn LockStore,
        lock_name: &str,
        holder: LockHolder,
        lease: Duration,
    ) -> Result<Self> {
        store.try_acquire(lock_name, &holder, lease)?;
        info!(
            "acquired lock '{lock_name}' as {} (pid {})",
            holder.locked_by, holder.pid
        );
        Ok(Self {
            store,
            lock_name: lock_name.to_string(),
            holder,
            lease,
            released: false,
        })
    }

    /// Extend the lease; fails if another process took the lock over.
    pub fn renew(&self) -> Result<()> {
        if self.store.renew(&self.lock_name, &self.holder, self.lease)? {
            debug!("renewed lock '{}'", self.lock_name);
            Ok(())
        } else {
            Err(Error::Integrity(format!(
                "lock '{}' is no longer held by this process",
                self.lock_name
            )))
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release(&self.lock_name, &self.holder)?;
        info!("released lock '{}'", self.lock_name);
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.store.release(&self.lock_name, &self.holder) {
            Ok(()) => info!("released lock '{}'", self.lock_name),
            Err(e) => warn!(
                "failed to release lock '{}': {e}; clear it with `dbward unlock`",
                self.lock_name
            ),
        }
    }
}

/// In-process lock table for tests.
#[derive(Default)]
pub struct MemoryLockStore {
    rows: Mutex<HashMap<String, LockInfo>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LockInfo>>> {
        self.rows
            .lock()
            .map_err(|_| Error::Database("lock table mutex poisoned".into()))
    }
}

impl LockStore for MemoryLockStore {
    fn try_acquire(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<()> {
        let mut rows = self.rows()?;
        let now = Utc::now();
        if let Some(existing) = rows.get(lock_name) {
            if !existing.is_expired(now) {
                return Err(existing.contention());
            }
            warn!(
                "taking over expired lock '{lock_name}' from {} (pid {})",
                existing.locked_by, existing.pid
            );
        }
        rows.insert(
            lock_name.to_string(),
            LockInfo {
                lock_name: lock_name.to_string(),
                locked_at: now,
                locked_by: holder.locked_by.clone(),
                pid: holder.pid,
                token: holder.token.clone(),
                expires_at: lease_expiry(now, lease),
            },
        );
        Ok(())
    }

    fn renew(&self, lock_name: &str, holder: &LockHolder, lease: Duration) -> Result<bool> {
        let mut rows = self.rows()?;
        match rows.get_mut(lock_name) {
            Some(row) if row.token == holder.token => {
                row.expires_at = lease_expiry(Utc::now(), lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, lock_name: &str, holder: &LockHolder) -> Result<()> {
        let mut rows = self.rows()?;
        if rows.get(lock_name).is_some_and(|r| r.token == holder.token) {
            rows.remove(lock_name);
        }
        Ok(())
    }

    fn force_release(&self, lock_name: &str) -> Result<bool> {
        Ok(self.rows()?.remove(lock_name).is_some())
    }

    fn current(&self, lock_name: &str) -> Result<Option<LockInfo>> {
        Ok(self.rows()?.get(lock_name).cloned())
    }
}
