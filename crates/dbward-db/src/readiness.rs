use std::path::PathBuf;
use std::time::{Duration, Instant};

use dbward_common::{Error, Result};
use tracing::{debug, info};

use crate::store::SqliteStore;

/// Finds where the target database lives.
pub trait DatabaseLocator {
    fn locate(&self) -> Result<PathBuf>;

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}

/// Database addressed by a file path within a namespace.
pub struct FileLocator {
    namespace: String,
    path: PathBuf,
}

impl FileLocator {
    pub fn new(namespace: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            path: path.into(),
        }
    }
}

impl DatabaseLocator for FileLocator {
    fn locate(&self) -> Result<PathBuf> {
        if self.path.exists() {
            Ok(self.path.clone())
        } else {
            Err(Error::Connectivity(format!(
                "no database at {} in namespace '{}' (run `dbward init` first)",
                self.path.display(),
                self.namespace
            )))
        }
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.path.display(), self.namespace)
    }
}

/// Locates the database and probes it until it answers a trivial query.
pub struct ReadinessChecker<'a> {
    locator: &'a dyn DatabaseLocator,
    timeout: Duration,
    interval: Duration,
}

impl<'a> ReadinessChecker<'a> {
    pub fn new(locator: &'a dyn DatabaseLocator, timeout: Duration, interval: Duration) -> Self {
        Self {
            locator,
            timeout,
            interval,
        }
    }

    /// Single probe; returns an open session on success.
    pub fn check(&self) -> Result<SqliteStore> {
        let path = self.locator.locate()?;
        let store = SqliteStore::open_existing(&path)?;
        store.ping()?;
        debug!("database at {} is ready", path.display());
        Ok(store)
    }

    /// Probe every `interval` until ready or `timeout` elapses.
    pub fn wait(&self) -> Result<SqliteStore> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.check() {
                Ok(store) => {
                    info!(
                        "database {} ready after {attempts} attempt(s)",
                        self.locator.describe()
                    );
                    return Ok(store);
                }
                Err(e) => {
                    let elapsed = started.elapsed();
                    if elapsed + self.interval > self.timeout {
                        return Err(Error::Connectivity(format!(
                            "database {} not ready after {}s: {e}",
                            self.locator.describe(),
                            elapsed.as_secs()
                        )));
                    }
                    debug!("attempt {attempts}: {e}; retrying");
                    std::thread::sleep(self.interval);
                }
            }
        }
    }
}
