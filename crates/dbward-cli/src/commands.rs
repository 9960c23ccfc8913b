use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dbward_config::DbWardConfig;
use dbward_db::{
    BackupEngine, BackupOptions, DirectorySource, FileLocator, LockStore, Migrator,
    ReadinessChecker, SnapshotStore, SqliteStore, generate_migration,
};
use tracing::{info, warn};

use crate::Command;
use crate::prompt::TerminalConfirmer;
use crate::report;

pub fn dispatch(config: &DbWardConfig, command: Command) -> Result<()> {
    match command {
        Command::Init => init(config),
        Command::Migrate { target } => migrate(config, target.as_deref()),
        Command::Status => status(config),
        Command::Backup { name } => backup(config, name.as_deref()),
        Command::Restore { name } => restore(config, &name),
        Command::Verify { name } => verify(config, &name),
        Command::List => list(config),
        Command::Cleanup { keep } => cleanup(config, keep.unwrap_or(config.keep_count)),
        Command::Reset => reset(config),
        Command::Generate { name } => generate(config, &name),
        Command::Check => check(config),
        Command::Wait { timeout } => wait(config, timeout),
        Command::Unlock => unlock(config),
    }
}

/// Probe the configured database once and make sure the bookkeeping tables
/// exist.
fn session(config: &DbWardConfig) -> Result<SqliteStore> {
    let locator = FileLocator::new(&config.namespace, config.database_path());
    let checker = ReadinessChecker::new(
        &locator,
        config.readiness.timeout(),
        config.readiness.interval(),
    );
    let store = checker.check()?;
    store.initialize()?;
    Ok(store)
}

fn migrator<'a>(
    config: &DbWardConfig,
    source: &'a DirectorySource,
    store: &'a SqliteStore,
) -> Migrator<'a> {
    Migrator::new(source, store, store, store, &config.user)
        .with_lock(&config.lock.name, config.lock.lease())
}

fn engine<'a>(config: &DbWardConfig, store: &'a SqliteStore) -> BackupEngine<'a> {
    let mut options = BackupOptions::new(
        &config.backup_dir,
        &config.namespace,
        &config.database,
        &config.user,
    );
    options.lock_name = config.lock.name.clone();
    options.lease = config.lock.lease();
    BackupEngine::new(store, store, options)
}

fn init(config: &DbWardConfig) -> Result<()> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to initialize database at {}", path.display()))?;
    store.ping()?;

    for dir in [&config.migrations_dir, &config.backup_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    info!("initialized {} in namespace '{}'", config.database, config.namespace);
    println!("Database ready at {}", path.display());
    println!("  migrations: {}", config.migrations_dir.display());
    println!("  backups:    {}", config.backup_dir.display());
    Ok(())
}

fn migrate(config: &DbWardConfig, target: Option<&str>) -> Result<()> {
    let store = session(config)?;
    let source = DirectorySource::new(&config.migrations_dir);
    let report = migrator(config, &source, &store).migrate(target)?;

    if report.applied.is_empty() {
        println!("Database is up to date.");
    } else {
        println!("Applied {} migration(s):", report.applied.len());
        for version in &report.applied {
            println!("  {version}");
        }
    }
    if !report.held_back.is_empty() {
        println!(
            "{} migration(s) after the target left pending.",
            report.held_back.len()
        );
    }
    Ok(())
}

fn status(config: &DbWardConfig) -> Result<()> {
    let store = session(config)?;
    let source = DirectorySource::new(&config.migrations_dir);
    let status = migrator(config, &source, &store).status()?;
    report::print_status(config, &status);
    Ok(())
}

fn backup(config: &DbWardConfig, name: Option<&str>) -> Result<()> {
    let store = session(config)?;
    let metadata = engine(config, &store).create_backup(name)?;
    println!(
        "Created backup '{}' ({}, sha256 {})",
        metadata.name, metadata.size, metadata.checksum
    );
    Ok(())
}

fn restore(config: &DbWardConfig, name: &str) -> Result<()> {
    let store = session(config)?;
    let report = engine(config, &store).restore(name, &TerminalConfirmer)?;
    println!("Restored backup '{}'.", report.restored.name);
    println!(
        "Previous state saved as '{}'.",
        report.safety_backup.name
    );
    Ok(())
}

fn verify(config: &DbWardConfig, name: &str) -> Result<()> {
    let store = session(config)?;
    let metadata = engine(config, &store).verify(name)?;
    println!(
        "Backup '{}' is intact ({}, sha256 {})",
        metadata.name, metadata.size, metadata.checksum
    );
    Ok(())
}

fn list(config: &DbWardConfig) -> Result<()> {
    let store = session(config)?;
    let engine = engine(config, &store);
    report::print_backups(engine.dir(), &engine.list()?);
    Ok(())
}

fn cleanup(config: &DbWardConfig, keep: usize) -> Result<()> {
    let store = session(config)?;
    let removed = engine(config, &store).cleanup(keep)?;
    if removed.is_empty() {
        println!("Nothing to remove; at most {keep} backup(s) present.");
    } else {
        println!("Removed {} backup(s):", removed.len());
        for name in &removed {
            println!("  {name}");
        }
    }
    Ok(())
}

fn reset(config: &DbWardConfig) -> Result<()> {
    let store = session(config)?;
    let safety = engine(config, &store).reset(&TerminalConfirmer)?;
    println!("Database '{}' reset.", config.database);
    println!("Previous state saved as '{}'.", safety.name);
    Ok(())
}

fn generate(config: &DbWardConfig, name: &str) -> Result<()> {
    let path = generate_migration(&config.migrations_dir, name, Utc::now())?;
    println!("Created {}", path.display());
    Ok(())
}

fn check(config: &DbWardConfig) -> Result<()> {
    let locator = FileLocator::new(&config.namespace, config.database_path());
    let checker = ReadinessChecker::new(
        &locator,
        config.readiness.timeout(),
        config.readiness.interval(),
    );
    checker.check()?;
    println!("Database '{}' is ready.", config.database);
    Ok(())
}

fn wait(config: &DbWardConfig, timeout: Option<u64>) -> Result<()> {
    let timeout = timeout.map_or_else(|| config.readiness.timeout(), Duration::from_secs);
    let locator = FileLocator::new(&config.namespace, config.database_path());
    let checker = ReadinessChecker::new(&locator, timeout, config.readiness.interval());
    info!("waiting up to {}s for {}", timeout.as_secs(), config.database);
    checker.wait()?;
    println!("Database '{}' is ready.", config.database);
    Ok(())
}

fn unlock(config: &DbWardConfig) -> Result<()> {
    let store = session(config)?;
    let lock_name = &config.lock.name;
    match store.current(lock_name)? {
        Some(info) => {
            warn!(
                "clearing lock '{lock_name}' held by {} (pid {}) since {}",
                info.locked_by,
                info.pid,
                info.locked_at.to_rfc3339()
            );
            store.force_release(lock_name)?;
            println!("Lock '{lock_name}' cleared.");
        }
        None => println!("Lock '{lock_name}' is not held."),
    }
    Ok(())
}
