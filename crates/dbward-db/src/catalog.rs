use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use dbward_common::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::log_store::MigrationRecord;

const MIGRATION_TEMPLATE: &str = include_str!("../templates/migration.sql");

/// `<YYYYMMDD>_<HHMM[SS]>_<name>`; the whole stem is the version.
static FILE_STEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{8}_\d{4}(?:\d{2})?)_([A-Za-z0-9][A-Za-z0-9_]*)$").expect("valid regex")
});

/// One versioned migration read from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub version: String,
    pub name: String,
    pub sql: String,
}

impl MigrationUnit {
    /// Build a unit from a file stem such as `20240101_0000_init`.
    pub fn from_stem(stem: &str, sql: impl Into<String>) -> Option<Self> {
        let caps = FILE_STEM.captures(stem)?;
        Some(Self {
            version: stem.to_string(),
            name: caps[2].to_string(),
            sql: sql.into(),
        })
    }

    /// SHA-256 of the raw file content, hex encoded.
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.sql.as_bytes()))
    }

    /// Statements to execute, without the file's own `BEGIN`/`COMMIT`
    /// wrapper. The runner supplies the transaction.
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
            .into_iter()
            .filter(|s| !is_transaction_control(s))
            .collect()
    }
}

/// Enumerates migration units. Implementations may return them in any
/// order; [`compute_pending`] sorts by version.
pub trait MigrationFileSource {
    fn units(&self) -> Result<Vec<MigrationUnit>>;
}

/// Reads `*.sql` files from a directory.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MigrationFileSource for DirectorySource {
    fn units(&self) -> Result<Vec<MigrationUnit>> {
        if !self.dir.exists() {
            warn!("migrations directory {} does not exist", self.dir.display());
            return Ok(Vec::new());
        }

        let mut units = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!("skipping migration with non-UTF-8 name: {}", path.display());
                continue;
            };
            let sql = std::fs::read_to_string(&path)?;
            match MigrationUnit::from_stem(stem, sql) {
                Some(unit) => units.push(unit),
                None => warn!(
                    "skipping {}: name must look like YYYYMMDD_HHMM_description.sql",
                    path.display()
                ),
            }
        }
        debug!("found {} migration(s) in {}", units.len(), self.dir.display());
        Ok(units)
    }
}

/// Fixed list of units, for tests and embedded catalogs.
#[derive(Default)]
pub struct MemorySource {
    units: Vec<MigrationUnit>,
}

impl MemorySource {
    pub fn new(units: Vec<MigrationUnit>) -> Self {
        Self { units }
    }

    pub fn push(&mut self, unit: MigrationUnit) {
        self.units.push(unit);
    }
}

impl MigrationFileSource for MemorySource {
    fn units(&self) -> Result<Vec<MigrationUnit>> {
        Ok(self.units.clone())
    }
}

/// Result of comparing the catalog against the migration log.
#[derive(Debug, Default)]
pub struct PendingSet {
    /// Units without a successful record, ascending by version.
    pub pending: Vec<MigrationUnit>,
    /// Logged versions with no catalog file.
    pub orphans: Vec<String>,
    /// Successfully applied versions whose file content changed since.
    pub drifted: Vec<String>,
}

/// Pending = catalog minus successfully applied, ordered by version string.
pub fn compute_pending(units: Vec<MigrationUnit>, records: &[MigrationRecord]) -> Result<PendingSet> {
    let mut catalog = BTreeMap::new();
    for unit in units {
        let version = unit.version.clone();
        if catalog.insert(version.clone(), unit).is_some() {
            return Err(Error::InvalidInput(format!(
                "duplicate migration version {version}"
            )));
        }
    }

    let applied: BTreeMap<&str, &MigrationRecord> = records
        .iter()
        .filter(|r| r.success)
        .map(|r| (r.version.as_str(), r))
        .collect();
    let logged: HashSet<&str> = records.iter().map(|r| r.version.as_str()).collect();

    let mut set = PendingSet::default();
    for version in logged {
        if !catalog.contains_key(version) {
            set.orphans.push(version.to_string());
        }
    }
    set.orphans.sort();

    for (version, unit) in catalog {
        match applied.get(version.as_str()) {
            Some(record) => {
                if record.checksum != unit.checksum() {
                    set.drifted.push(version);
                }
            }
            None => set.pending.push(unit),
        }
    }
    Ok(set)
}

/// Write a new migration file from the template. Returns its path.
pub fn generate_migration(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(Error::InvalidInput(format!(
            "migration name '{name}' has no usable characters"
        )));
    }
    let version = format!("{}_{slug}", now.format("%Y%m%d_%H%M"));
    let path = dir.join(format!("{version}.sql"));
    if path.exists() {
        return Err(Error::InvalidInput(format!(
            "migration {} already exists",
            path.display()
        )));
    }

    std::fs::create_dir_all(dir)?;
    let content = MIGRATION_TEMPLATE
        .replace("{{version}}", &version)
        .replace("{{name}}", name.trim())
        .replace("{{created_at}}", &now.to_rfc3339());
    std::fs::write(&path, content)?;
    Ok(path)
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn is_transaction_control(statement: &str) -> bool {
    let words: Vec<String> = statement
        .split_whitespace()
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    matches!(
        words.as_slice(),
        ["BEGIN"]
            | ["BEGIN", "TRANSACTION"]
            | ["BEGIN", "DEFERRED" | "IMMEDIATE" | "EXCLUSIVE"]
            | ["BEGIN", "DEFERRED" | "IMMEDIATE" | "EXCLUSIVE", "TRANSACTION"]
            | ["COMMIT"]
            | ["COMMIT", "TRANSACTION"]
            | ["END"]
            | ["END", "TRANSACTION"]
    )
}

#[derive(Clone, Copy, PartialEq, Default)]
enum Scan {
    #[default]
    Normal,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split a SQL batch into statements on top-level semicolons. Quoted text,
/// comments and `CREATE TRIGGER ... BEGIN ... END` bodies are respected;
/// comments are dropped from the output.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut splitter = StatementSplitter::default();
    let mut statements = Vec::new();
    splitter.feed(sql, &mut statements);
    statements.extend(splitter.finish());
    statements
}

/// Incremental form of [`split_statements`]. Input may arrive in pieces as
/// long as every piece but the last ends on a line boundary.
#[derive(Default)]
pub(crate) struct StatementSplitter {
    current: String,
    word: String,
    leading_words: Vec<String>,
    depth: usize,
    state: Scan,
}

impl StatementSplitter {
    /// Scan `text`, pushing every statement it completes onto `out`.
    pub(crate) fn feed(&mut self, text: &str, out: &mut Vec<String>) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match self.state {
                Scan::Quoted(close) => {
                    self.current.push(c);
                    if c == close {
                        self.state = Scan::Normal;
                    }
                }
                Scan::LineComment => {
                    if c == '\n' {
                        self.current.push('\n');
                        self.state = Scan::Normal;
                    }
                }
                Scan::BlockComment => {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        self.current.push(' ');
                        self.state = Scan::Normal;
                    }
                }
                Scan::Normal => {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        self.word.push(c);
                        self.current.push(c);
                        continue;
                    }
                    self.finish_word();
                    match c {
                        '\'' | '"' | '`' => {
                            self.current.push(c);
                            self.state = Scan::Quoted(c);
                        }
                        '[' => {
                            self.current.push(c);
                            self.state = Scan::Quoted(']');
                        }
                        '-' if chars.peek() == Some(&'-') => {
                            chars.next();
                            self.state = Scan::LineComment;
                        }
                        '/' if chars.peek() == Some(&'*') => {
                            chars.next();
                            self.state = Scan::BlockComment;
                        }
                        ';' if self.depth == 0 => {
                            let statement = self.current.trim();
                            if !statement.is_empty() {
                                out.push(statement.to_string());
                            }
                            self.current.clear();
                            self.leading_words.clear();
                        }
                        _ => self.current.push(c),
                    }
                }
            }
        }
    }

    /// The trailing statement with no closing semicolon, if any.
    pub(crate) fn finish(mut self) -> Option<String> {
        self.finish_word();
        let tail = self.current.trim();
        (!tail.is_empty()).then(|| tail.to_string())
    }

    // The first words decide whether this is a trigger; inside a trigger
    // BEGIN/CASE open blocks that END closes.
    fn finish_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let upper = self.word.to_ascii_uppercase();
        if self.leading_words.len() < 4 {
            self.leading_words.push(upper.clone());
        }
        let is_trigger = self.leading_words.first().is_some_and(|w| w == "CREATE")
            && self.leading_words.iter().any(|w| w == "TRIGGER");
        if is_trigger {
            match upper.as_str() {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
        }
        self.word.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unit(version: &str, sql: &str) -> MigrationUnit {
        MigrationUnit::from_stem(version, sql).expect("valid stem")
    }

    fn applied(version: &str, checksum: &str, success: bool) -> MigrationRecord {
        MigrationRecord {
            version: version.to_string(),
            name: "x".to_string(),
            checksum: checksum.to_string(),
            applied_at: Utc::now(),
            applied_by: "test".to_string(),
            execution_time_ms: 1,
            success,
            error_message: None,
        }
    }

    #[test]
    fn stem_parsing_extracts_name() {
        let u = unit("20240101_0000_init", "");
        assert_eq!(u.version, "20240101_0000_init");
        assert_eq!(u.name, "init");

        assert!(MigrationUnit::from_stem("20240101_000000_add_users", "").is_some());
        assert!(MigrationUnit::from_stem("init", "").is_none());
        assert!(MigrationUnit::from_stem("2024_0000_init", "").is_none());
        assert!(MigrationUnit::from_stem("20240101_0000_", "").is_none());
    }

    #[test]
    fn pending_is_sorted_regardless_of_input_order() {
        let units = vec![
            unit("20240103_0000_c", "SELECT 3;"),
            unit("20240101_0000_a", "SELECT 1;"),
            unit("20240102_0000_b", "SELECT 2;"),
        ];
        let mut reversed = units.clone();
        reversed.reverse();

        let a = compute_pending(units, &[]).unwrap();
        let b = compute_pending(reversed, &[]).unwrap();
        let versions = |s: &PendingSet| s.pending.iter().map(|u| u.version.clone()).collect::<Vec<_>>();

        assert_eq!(
            versions(&a),
            vec!["20240101_0000_a", "20240102_0000_b", "20240103_0000_c"]
        );
        assert_eq!(versions(&a), versions(&b));
    }

    #[test]
    fn applied_versions_are_excluded_but_failures_stay_pending() {
        let a = unit("20240101_0000_a", "SELECT 1;");
        let b = unit("20240102_0000_b", "SELECT 2;");
        let records = vec![
            applied(&a.version, &a.checksum(), true),
            applied(&b.version, &b.checksum(), false),
        ];

        let set = compute_pending(vec![a, b.clone()], &records).unwrap();
        assert_eq!(set.pending, vec![b]);
        assert!(set.orphans.is_empty());
        assert!(set.drifted.is_empty());
    }

    #[test]
    fn orphans_and_drift_are_reported() {
        let a = unit("20240101_0000_a", "SELECT 1;");
        let records = vec![
            applied(&a.version, "not-the-checksum", true),
            applied("20231231_0000_gone", "abc", true),
        ];

        let set = compute_pending(vec![a], &records).unwrap();
        assert!(set.pending.is_empty());
        assert_eq!(set.orphans, vec!["20231231_0000_gone"]);
        assert_eq!(set.drifted, vec!["20240101_0000_a"]);
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let units = vec![
            unit("20240101_0000_a", "SELECT 1;"),
            unit("20240101_0000_a", "SELECT 2;"),
        ];
        assert!(compute_pending(units, &[]).is_err());
    }

    #[test]
    fn split_drops_comments_and_transaction_wrapper() {
        let u = unit(
            "20240101_0000_init",
            "-- header\nBEGIN;\nCREATE TABLE t (id INTEGER); /* trailing */\n\
             INSERT INTO t VALUES (1);\nCOMMIT;\n",
        );
        assert_eq!(
            u.statements(),
            vec!["CREATE TABLE t (id INTEGER)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn split_respects_quotes() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b', 'it''s'); SELECT \"x;y\" FROM t");
        assert_eq!(
            stmts,
            vec!["INSERT INTO t VALUES ('a;b', 'it''s')", "SELECT \"x;y\" FROM t"]
        );
    }

    #[test]
    fn line_by_line_feeding_matches_whole_split() {
        let sql = "CREATE TABLE t (v TEXT); -- note\n\
                   INSERT INTO t VALUES ('a;\nb');\n\
                   CREATE TRIGGER trg AFTER INSERT ON t BEGIN\n\
                   UPDATE t SET v = v;\nEND;\n/* tail */ SELECT 1";
        let mut splitter = StatementSplitter::default();
        let mut fed = Vec::new();
        for line in sql.split_inclusive('\n') {
            splitter.feed(line, &mut fed);
        }
        fed.extend(splitter.finish());
        assert_eq!(fed, split_statements(sql));
        assert_eq!(fed.len(), 4);
        assert_eq!(fed[1], "INSERT INTO t VALUES ('a;\nb')");
    }

    #[test]
    fn split_keeps_trigger_bodies_whole() {
        let sql = "CREATE TRIGGER trg AFTER INSERT ON t BEGIN\n\
                   UPDATE t SET n = CASE WHEN n IS NULL THEN 0 ELSE n END;\n\
                   INSERT INTO log VALUES (new.id);\nEND;\nSELECT 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TRIGGER trg"));
        assert!(stmts[0].ends_with("END"));
        assert_eq!(stmts[1], "SELECT 1");
    }

    #[test]
    fn directory_source_skips_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101_0000_init.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("notes.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();

        let units = DirectorySource::new(dir.path()).units().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].version, "20240101_0000_init");
    }

    #[test]
    fn missing_directory_yields_empty_catalog() {
        let units = DirectorySource::new("/nonexistent/migrations").units().unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn generate_writes_template_with_version() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();
        let path = generate_migration(dir.path(), "Add Users table", now).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20240305_1407_add_users_table.sql"
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- Migration: 20240305_1407_add_users_table"));
        assert!(content.contains("BEGIN;"));

        // The generated file parses back as a unit with no executable statements.
        let units = DirectorySource::new(dir.path()).units().unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].statements().is_empty());

        assert!(generate_migration(dir.path(), "add users table", now).is_err());
        assert!(generate_migration(dir.path(), "!!!", now).is_err());
    }
}
