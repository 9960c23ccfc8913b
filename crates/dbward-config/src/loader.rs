use std::path::{Path, PathBuf};
use std::str::FromStr;

use dbward_common::{Error, Result};
use tracing::{debug, info};

use crate::model::DbWardConfig;

/// File names probed in the working directory when no path is given.
const DEFAULT_CONFIG_FILES: &[&str] = &["dbward.yml", "dbward.yaml", "dbward.toml"];

/// Builds a [`DbWardConfig`] from defaults, an optional config file and the
/// `DBWARD_*` environment variables, in that order of precedence.
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<DbWardConfig> {
        let mut config = match self.resolve_path()? {
            Some(path) => {
                info!("loading config from {}", path.display());
                parse_config_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                DbWardConfig::default()
            }
        };
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }
        Ok(DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists()))
    }
}

fn parse_config_file(path: &Path) -> Result<DbWardConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
        "toml" => {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

/// Overlay `DBWARD_*` variables onto `config`. `lookup` is injected so the
/// overlay can be exercised without touching the process environment.
pub fn apply_env_overrides<F>(config: &mut DbWardConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = get("DBWARD_NAMESPACE") {
        config.namespace = v;
    }
    if let Some(v) = get("DBWARD_DATABASE") {
        config.database = v;
    }
    if let Some(v) = get("DBWARD_USER") {
        config.user = v;
    }
    if let Some(v) = get("DBWARD_DATA_DIR") {
        config.data_dir = PathBuf::from(v);
    }
    if let Some(v) = get("DBWARD_DATABASE_PATH") {
        config.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("DBWARD_MIGRATIONS_DIR") {
        config.migrations_dir = PathBuf::from(v);
    }
    if let Some(v) = get("DBWARD_BACKUP_DIR") {
        config.backup_dir = PathBuf::from(v);
    }
    if let Some(v) = get("DBWARD_KEEP_COUNT") {
        config.keep_count = parse_number("DBWARD_KEEP_COUNT", &v)?;
    }
    if let Some(v) = get("DBWARD_LOCK_NAME") {
        config.lock.name = v;
    }
    if let Some(v) = get("DBWARD_LOCK_LEASE_SECS") {
        config.lock.lease_secs = parse_number("DBWARD_LOCK_LEASE_SECS", &v)?;
    }
    if let Some(v) = get("DBWARD_WAIT_TIMEOUT") {
        config.readiness.timeout_secs = parse_number("DBWARD_WAIT_TIMEOUT", &v)?;
    }
    Ok(())
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}
