//! Compressed, checksummed full-database snapshots.
//!
//! Each backup is two files in the backup directory:
//! `<name>.sql.gz` (gzip of a plain-SQL dump) and `<name>.meta.json`
//! (the [`BackupMetadata`] sidecar). The checksum is the SHA-256 of the
//! uncompressed dump.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dbward_common::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::dump::DUMP_HEADER;
use crate::lock::{LockGuard, LockHolder, LockStore};
use crate::runner::{DEFAULT_LEASE, DEFAULT_LOCK_NAME};

pub const RESTORE_CONFIRMATION: &str = "yes";
pub const RESET_CONFIRMATION: &str = "RESET ALL DATA";

const BLOB_SUFFIX: &str = ".sql.gz";
const META_SUFFIX: &str = ".meta.json";
const DELETING_SUFFIX: &str = ".deleting";
const FORMAT_VERSION: u32 = 1;

static BACKUP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

/// Store that can be dumped and replaced wholesale.
pub trait SnapshotStore {
    /// Write a logical dump of every user object (the lock table excluded).
    fn dump(&self, out: &mut dyn Write) -> Result<()>;

    /// Replace current content with the dump read from `dump`, in one
    /// transaction.
    fn restore(&self, dump: &mut dyn BufRead) -> Result<()>;

    /// Drop every user object except the lock table.
    fn reset_schema(&self) -> Result<()>;

    /// Create the migration log and lock tables if they are missing.
    fn initialize(&self) -> Result<()>;
}

/// What the operator is asked to confirm.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub action: String,
    pub details: String,
    /// The exact text the operator must type.
    pub phrase: &'static str,
}

/// Source of operator confirmations for destructive operations.
pub trait Confirm {
    /// Show `request` and return what the operator typed.
    fn confirm(&self, request: &ConfirmationRequest) -> Result<String>;
}

/// Sidecar metadata, readable without decompressing the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub name: String,
    pub namespace: String,
    pub database: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    /// Compressed archive size in bytes.
    pub size_bytes: u64,
    /// `size_bytes`, human readable.
    pub size: String,
    /// SHA-256 of the uncompressed dump, hex encoded.
    pub checksum: String,
    pub format_version: u32,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub dir: PathBuf,
    pub namespace: String,
    pub database: String,
    pub user: String,
    pub lock_name: String,
    pub lease: Duration,
}

impl BackupOptions {
    pub fn new(
        dir: impl Into<PathBuf>,
        namespace: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            namespace: namespace.into(),
            database: database.into(),
            user: user.into(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lease: DEFAULT_LEASE,
        }
    }
}

#[derive(Debug)]
pub struct RestoreReport {
    pub restored: BackupMetadata,
    pub safety_backup: BackupMetadata,
}

pub struct BackupEngine<'a> {
    store: &'a dyn SnapshotStore,
    locks: &'a dyn LockStore,
    options: BackupOptions,
}

impl<'a> BackupEngine<'a> {
    pub fn new(store: &'a dyn SnapshotStore, locks: &'a dyn LockStore, options: BackupOptions) -> Self {
        Self {
            store,
            locks,
            options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.options.dir.join(format!("{name}{BLOB_SUFFIX}"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.options.dir.join(format!("{name}{META_SUFFIX}"))
    }

    /// Dump, compress and checksum the database. `name` defaults to
    /// `backup_<timestamp>`.
    pub fn create_backup(&self, name: Option<&str>) -> Result<BackupMetadata> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S")),
        };
        validate_name(&name)?;

        let blob_path = self.blob_path(&name);
        let meta_path = self.meta_path(&name);
        if blob_path.exists() || meta_path.exists() {
            return Err(Error::InvalidInput(format!("backup '{name}' already exists")));
        }
        fs::create_dir_all(&self.options.dir)?;

        info!("creating backup '{name}' of {}", self.options.database);
        let created_at = Utc::now();
        let tmp = NamedTempFile::new_in(&self.options.dir)?;
        let encoder = GzEncoder::new(BufWriter::new(tmp), Compression::default());
        let mut writer = HashingWriter::new(encoder);
        self.store.dump(&mut writer)?;
        let (encoder, checksum) = writer.finish();
        let tmp = encoder
            .finish()?
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        tmp.as_file().sync_all()?;
        let size_bytes = tmp.as_file().metadata()?.len();
        tmp.persist_noclobber(&blob_path)
            .map_err(|e| Error::Io(e.error))?;

        let metadata = BackupMetadata {
            name: name.clone(),
            namespace: self.options.namespace.clone(),
            database: self.options.database.clone(),
            user: self.options.user.clone(),
            created_at,
            size_bytes,
            size: format_size(size_bytes),
            checksum,
            format_version: FORMAT_VERSION,
        };
        if let Err(e) = write_sidecar(&self.options.dir, &meta_path, &metadata) {
            if let Err(remove_err) = fs::remove_file(&blob_path) {
                warn!(
                    "failed to remove {} after sidecar error: {remove_err}; `dbward cleanup` will sweep it",
                    blob_path.display()
                );
            }
            return Err(e);
        }

        info!(
            "backup '{name}' written to {} ({})",
            blob_path.display(),
            metadata.size
        );
        Ok(metadata)
    }

    /// Check the archive decompresses cleanly and matches its sidecar.
    pub fn verify(&self, name: &str) -> Result<BackupMetadata> {
        let (metadata, _) = self.open_verified(name)?;
        info!("backup '{name}' verified (sha256 {})", metadata.checksum);
        Ok(metadata)
    }

    /// Verify backup `name` and return its archive rewound to the start, so
    /// the bytes later restored are the ones that were checked.
    fn open_verified(&self, name: &str) -> Result<(BackupMetadata, fs::File)> {
        validate_name(name)?;
        let metadata = self.read_metadata(name)?;
        if metadata.name != name {
            return Err(Error::Integrity(format!(
                "sidecar for '{name}' describes backup '{}'",
                metadata.name
            )));
        }

        let blob_path = self.blob_path(name);
        let mut archive = match fs::File::open(&blob_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("backup archive {}", blob_path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let actual_size = archive.metadata()?.len();
        if actual_size != metadata.size_bytes {
            return Err(Error::Integrity(format!(
                "backup '{name}' is {actual_size} bytes, sidecar says {}",
                metadata.size_bytes
            )));
        }

        let mut head = PrefixWriter::new(DUMP_HEADER.len());
        let checksum = decompress(&mut archive, &mut head)
            .map_err(|e| Error::Integrity(format!("backup '{name}' is corrupt: {e}")))?;
        if checksum != metadata.checksum {
            return Err(Error::Integrity(format!(
                "backup '{name}' checksum mismatch: sidecar {}, archive {checksum}",
                metadata.checksum
            )));
        }
        if head.prefix != DUMP_HEADER.as_bytes() {
            return Err(Error::Integrity(format!(
                "backup '{name}' does not contain a dbward dump"
            )));
        }
        archive.rewind()?;
        Ok((metadata, archive))
    }

    fn read_metadata(&self, name: &str) -> Result<BackupMetadata> {
        let path = self.meta_path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("backup '{name}'")));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Integrity(format!("unreadable sidecar {}: {e}", path.display())))
    }

    /// Complete backups, newest first. Half-present artifacts are warned
    /// about and left out.
    pub fn list(&self) -> Result<Vec<BackupMetadata>> {
        let scan = self.scan()?;
        let mut backups = Vec::new();
        for name in scan.complete() {
            match self.read_metadata(name) {
                Ok(metadata) => backups.push(metadata),
                Err(e) => warn!("skipping backup '{name}': {e}"),
            }
        }
        for name in scan.sidecars.difference(&scan.blobs) {
            warn!("backup '{name}' has a sidecar but no archive; skipping");
        }
        for name in scan.blobs.difference(&scan.sidecars) {
            warn!("backup archive '{name}' has no metadata sidecar; skipping");
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    fn scan(&self) -> Result<DirScan> {
        let mut scan = DirScan::default();
        if !self.options.dir.exists() {
            return Ok(scan);
        }
        for entry in fs::read_dir(&self.options.dir)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(DELETING_SUFFIX) {
                scan.staged.push(file_name.to_string());
            } else if let Some(name) = file_name.strip_suffix(META_SUFFIX) {
                scan.sidecars.insert(name.to_string());
            } else if let Some(name) = file_name.strip_suffix(BLOB_SUFFIX) {
                scan.blobs.insert(name.to_string());
            }
        }
        Ok(scan)
    }

    /// Delete all but the newest `keep_count` backups. Returns the removed
    /// names.
    pub fn cleanup(&self, keep_count: usize) -> Result<Vec<String>> {
        if keep_count == 0 {
            return Err(Error::InvalidInput("keep_count must be at least 1".into()));
        }
        let mut removed = Vec::new();
        for metadata in self.list()?.into_iter().skip(keep_count) {
            self.remove_artifact(&metadata.name)?;
            info!("removed backup '{}'", metadata.name);
            removed.push(metadata.name);
        }
        info!("retention: kept {keep_count}, removed {}", removed.len());
        self.sweep_orphans()?;
        Ok(removed)
    }

    /// Delete what interrupted backups and removals leave behind: archives
    /// without a sidecar, sidecars without an archive and staged deletions.
    fn sweep_orphans(&self) -> Result<()> {
        let scan = self.scan()?;
        let mut orphans: Vec<PathBuf> = scan
            .staged
            .iter()
            .map(|file_name| self.options.dir.join(file_name))
            .collect();
        orphans.extend(scan.blobs.difference(&scan.sidecars).map(|n| self.blob_path(n)));
        orphans.extend(scan.sidecars.difference(&scan.blobs).map(|n| self.meta_path(n)));

        for path in orphans {
            warn!("removing orphaned backup file {}", path.display());
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove archive and sidecar together. The sidecar is staged aside
    /// first so a failed archive removal can be rolled back.
    fn remove_artifact(&self, name: &str) -> Result<()> {
        let meta_path = self.meta_path(name);
        let staged = self
            .options
            .dir
            .join(format!("{name}{META_SUFFIX}{DELETING_SUFFIX}"));
        fs::rename(&meta_path, &staged)?;
        match fs::remove_file(self.blob_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                fs::rename(&staged, &meta_path)?;
                return Err(e.into());
            }
        }
        fs::remove_file(&staged)?;
        Ok(())
    }

    /// Replace the database with backup `name`. Verifies the archive,
    /// demands the [`RESTORE_CONFIRMATION`] phrase and takes a safety backup
    /// first.
    pub fn restore(&self, name: &str, confirm: &dyn Confirm) -> Result<RestoreReport> {
        let (restored, archive) = self.open_verified(name)?;
        self.require_confirmation(
            confirm,
            ConfirmationRequest {
                action: format!("restore backup '{name}'"),
                details: format!(
                    "All data in database '{}' will be replaced with the snapshot taken {}.",
                    self.options.database,
                    restored.created_at.to_rfc3339()
                ),
                phrase: RESTORE_CONFIRMATION,
            },
        )?;

        let guard = self.acquire_lock()?;
        let safety_backup = self.create_backup(Some(&safety_name("pre_restore")))?;
        info!("restoring '{name}' into {}", self.options.database);
        let mut dump = BufReader::new(GzDecoder::new(BufReader::new(archive)));
        self.store.restore(&mut dump)?;
        self.store.initialize()?;
        guard.release()?;

        info!(
            "restored '{name}'; previous state saved as '{}'",
            safety_backup.name
        );
        Ok(RestoreReport {
            restored,
            safety_backup,
        })
    }

    /// Drop and recreate the whole schema after a safety backup. Demands
    /// the [`RESET_CONFIRMATION`] phrase. Returns the safety backup.
    pub fn reset(&self, confirm: &dyn Confirm) -> Result<BackupMetadata> {
        self.require_confirmation(
            confirm,
            ConfirmationRequest {
                action: format!("reset database '{}'", self.options.database),
                details: format!(
                    "Every table, view, index and trigger in '{}' ({}) will be dropped.",
                    self.options.database, self.options.namespace
                ),
                phrase: RESET_CONFIRMATION,
            },
        )?;

        let guard = self.acquire_lock()?;
        let safety_backup = self.create_backup(Some(&safety_name("pre_reset")))?;
        warn!("resetting schema of {}", self.options.database);
        self.store.reset_schema()?;
        self.store.initialize()?;
        guard.release()?;

        info!(
            "database reset; previous state saved as '{}'",
            safety_backup.name
        );
        Ok(safety_backup)
    }

    fn acquire_lock(&self) -> Result<LockGuard<'a>> {
        LockGuard::acquire(
            self.locks,
            &self.options.lock_name,
            LockHolder::current(&self.options.user),
            self.options.lease,
        )
    }

    fn require_confirmation(&self, confirm: &dyn Confirm, request: ConfirmationRequest) -> Result<()> {
        warn!(
            "about to {}; type '{}' to continue",
            request.action, request.phrase
        );
        let answer = confirm.confirm(&request)?;
        if answer.trim() != request.phrase {
            return Err(Error::ConfirmationAborted(format!(
                "{} was not confirmed",
                request.action
            )));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if !BACKUP_NAME.is_match(name) || name.ends_with(DELETING_SUFFIX) {
        return Err(Error::InvalidInput(format!(
            "invalid backup name '{name}': use letters, digits, '_', '-' or '.'"
        )));
    }
    Ok(())
}

fn safety_name(prefix: &str) -> String {
    format!("{prefix}_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"))
}

fn write_sidecar(dir: &Path, path: &Path, metadata: &BackupMetadata) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(metadata)?)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Decompress `archive` into `out`, returning the SHA-256 of the output.
fn decompress(archive: impl Read, out: &mut dyn Write) -> io::Result<String> {
    let mut decoder = GzDecoder::new(BufReader::new(archive));
    let mut writer = HashingWriter::new(out);
    io::copy(&mut decoder, &mut writer)?;
    let (_, checksum) = writer.finish();
    Ok(checksum)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Artifact files found in the backup directory, by backup name.
#[derive(Default)]
struct DirScan {
    sidecars: BTreeSet<String>,
    blobs: BTreeSet<String>,
    /// File names of sidecars staged for deletion.
    staged: Vec<String>,
}

impl DirScan {
    fn complete(&self) -> impl Iterator<Item = &String> {
        self.sidecars.intersection(&self.blobs)
    }
}

/// Keeps the first `limit` bytes written and discards the rest.
struct PrefixWriter {
    prefix: Vec<u8>,
    limit: usize,
}

impl PrefixWriter {
    fn new(limit: usize) -> Self {
        Self {
            prefix: Vec::with_capacity(limit),
            limit,
        }
    }
}

impl Write for PrefixWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = buf.len().min(self.limit - self.prefix.len());
        self.prefix.extend_from_slice(&buf[..take]);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forwards writes while hashing them.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::store::SqliteStore;

    struct Answer(&'static str);

    impl Confirm for Answer {
        fn confirm(&self, _request: &ConfirmationRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn engine<'a>(store: &'a SqliteStore, dir: &Path) -> BackupEngine<'a> {
        BackupEngine::new(store, store, BackupOptions::new(dir, "test", "app", "tester"))
    }

    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT); INSERT INTO t (v) VALUES ('a');")
            .unwrap();
        store
    }

    #[test]
    fn create_writes_blob_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());

        let meta = engine.create_backup(Some("first")).unwrap();
        assert!(dir.path().join("first.sql.gz").exists());
        assert!(dir.path().join("first.meta.json").exists());
        assert_eq!(meta.database, "app");
        assert_eq!(meta.user, "tester");
        assert_eq!(meta.checksum.len(), 64);
        assert_eq!(engine.verify("first").unwrap(), meta);

        // Artifacts are immutable.
        assert!(matches!(
            engine.create_backup(Some("first")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        engine.create_backup(Some("b")).unwrap();

        let meta_path = dir.path().join("b.meta.json");
        let mut meta: BackupMetadata =
            serde_json::from_slice(&fs::read(&meta_path).unwrap()).unwrap();
        meta.checksum = "0".repeat(64);
        fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        assert!(matches!(engine.verify("b"), Err(Error::Integrity(_))));
    }

    #[test]
    fn verify_detects_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        let meta = engine.create_backup(Some("b")).unwrap();

        let garbage = vec![0x42u8; meta.size_bytes as usize];
        fs::write(dir.path().join("b.sql.gz"), garbage).unwrap();
        assert!(matches!(engine.verify("b"), Err(Error::Integrity(_))));
    }

    #[test]
    fn missing_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        assert!(matches!(engine.verify("nope"), Err(Error::NotFound(_))));
        assert!(matches!(
            engine.restore("nope", &Answer("yes")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn declined_restore_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        engine.create_backup(Some("b")).unwrap();
        store.execute_batch("INSERT INTO t (v) VALUES ('b');").unwrap();

        let err = engine.restore("b", &Answer("no")).unwrap_err();
        assert!(matches!(err, Error::ConfirmationAborted(_)));
        assert_eq!(engine.list().unwrap().len(), 1, "no safety backup taken");
        let count: i64 = store.query_scalar("SELECT count(*) FROM t").unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn reset_requires_the_stronger_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());

        assert!(matches!(
            engine.reset(&Answer(RESTORE_CONFIRMATION)),
            Err(Error::ConfirmationAborted(_))
        ));

        let safety = engine.reset(&Answer(RESET_CONFIRMATION)).unwrap();
        assert!(safety.name.starts_with("pre_reset_"));
        let tables: i64 = store
            .query_scalar("SELECT count(*) FROM sqlite_master WHERE name = 't'")
            .unwrap();
        assert_eq!(tables, 0);
        // Migration bookkeeping survives the reset.
        let log: i64 = store
            .query_scalar("SELECT count(*) FROM sqlite_master WHERE name = 'schema_migrations'")
            .unwrap();
        assert_eq!(log, 1);
    }

    #[test]
    fn list_skips_half_present_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        engine.create_backup(Some("whole")).unwrap();
        fs::write(dir.path().join("lonely.sql.gz"), b"x").unwrap();
        fs::write(dir.path().join("ghost.meta.json"), b"{}").unwrap();

        let names: Vec<_> = engine.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["whole"]);
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(validate_name("nightly-2024.01.01").is_ok());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("x.deleting").is_err());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn cleanup_sweeps_orphaned_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        for name in ["b0", "b1", "b2"] {
            engine.create_backup(Some(name)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        fs::write(dir.path().join("crashed.sql.gz"), b"partial").unwrap();
        fs::write(dir.path().join("ghost.meta.json"), b"{}").unwrap();
        fs::write(dir.path().join("old.meta.json.deleting"), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"mine").unwrap();

        assert_eq!(engine.cleanup(1).unwrap(), vec!["b1", "b0"]);

        let mut files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();
        assert_eq!(files, vec!["b2.meta.json", "b2.sql.gz", "notes.txt"]);
    }

    #[test]
    fn restore_and_reset_wait_for_a_running_migration() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine(&store, dir.path());
        engine.create_backup(Some("b")).unwrap();

        let migrator = LockHolder::current("migrator");
        store
            .try_acquire(DEFAULT_LOCK_NAME, &migrator, DEFAULT_LEASE)
            .unwrap();

        assert!(matches!(
            engine.restore("b", &Answer(RESTORE_CONFIRMATION)),
            Err(Error::LockContention { .. })
        ));
        assert!(matches!(
            engine.reset(&Answer(RESET_CONFIRMATION)),
            Err(Error::LockContention { .. })
        ));

        // Neither took a safety backup or touched data.
        assert_eq!(engine.list().unwrap().len(), 1);
        let rows: i64 = store.query_scalar("SELECT count(*) FROM t").unwrap();
        assert_eq!(rows, 1);
        assert_eq!(store.current(DEFAULT_LOCK_NAME).unwrap().unwrap().token, migrator.token);
    }

    /// Wraps a real store and fails on demand.
    struct Flaky {
        inner: SqliteStore,
        fail_dump: Cell<bool>,
        fail_restore: bool,
    }

    impl SnapshotStore for Flaky {
        fn dump(&self, out: &mut dyn Write) -> Result<()> {
            if self.fail_dump.get() {
                return Err(Error::Io(io::Error::other("disk full")));
            }
            self.inner.dump(out)
        }

        fn restore(&self, dump: &mut dyn BufRead) -> Result<()> {
            if self.fail_restore {
                return Err(Error::Database("failed to load dump: boom".into()));
            }
            self.inner.restore(dump)
        }

        fn reset_schema(&self) -> Result<()> {
            self.inner.reset_schema()
        }

        fn initialize(&self) -> Result<()> {
            self.inner.initialize()
        }
    }

    fn flaky(fail_restore: bool) -> Flaky {
        Flaky {
            inner: seeded_store(),
            fail_dump: Cell::new(false),
            fail_restore,
        }
    }

    #[test]
    fn lock_is_released_when_the_load_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = flaky(true);
        let locks = MemoryLockStore::new();
        let engine = BackupEngine::new(
            &store,
            &locks,
            BackupOptions::new(dir.path(), "test", "app", "tester"),
        );
        engine.create_backup(Some("b")).unwrap();

        let err = engine.restore("b", &Answer(RESTORE_CONFIRMATION)).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(locks.current(DEFAULT_LOCK_NAME).unwrap().is_none());
    }

    #[test]
    fn lock_is_released_when_the_safety_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = flaky(false);
        let locks = MemoryLockStore::new();
        let engine = BackupEngine::new(
            &store,
            &locks,
            BackupOptions::new(dir.path(), "test", "app", "tester"),
        );
        engine.create_backup(Some("b")).unwrap();
        store.fail_dump.set(true);

        assert!(matches!(
            engine.restore("b", &Answer(RESTORE_CONFIRMATION)),
            Err(Error::Io(_))
        ));
        assert!(locks.current(DEFAULT_LOCK_NAME).unwrap().is_none());

        assert!(matches!(
            engine.reset(&Answer(RESET_CONFIRMATION)),
            Err(Error::Io(_))
        ));
        assert!(locks.current(DEFAULT_LOCK_NAME).unwrap().is_none());
        let rows: i64 = store.inner.query_scalar("SELECT count(*) FROM t").unwrap();
        assert_eq!(rows, 1, "reset must not drop anything without a safety backup");
    }
}
