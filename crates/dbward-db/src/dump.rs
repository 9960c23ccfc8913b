//! Plain-SQL logical dumps of a SQLite database.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use dbward_common::{Error, Result};
use rusqlite::Connection;
use rusqlite::types::ValueRef;

use crate::catalog::StatementSplitter;

pub(crate) const DUMP_HEADER: &str = "-- dbward logical dump\n-- format: 1\n";

/// User tables and views, excluding SQLite's internal objects.
const USER_OBJECTS: &str = "SELECT type, name, sql FROM sqlite_master \
     WHERE name NOT LIKE 'sqlite\\_%' ESCAPE '\\' AND tbl_name != ?1";

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Database(format!("{context}: {e}"))
}

/// Write every user table's DDL and rows, then `sqlite_sequence`, then
/// indexes, triggers and views in creation order. `skip_table` is left out
/// entirely.
pub(crate) fn write_dump(conn: &Connection, out: &mut dyn Write, skip_table: &str) -> Result<()> {
    out.write_all(DUMP_HEADER.as_bytes())?;

    let tables = query_objects(
        conn,
        &format!("{USER_OBJECTS} AND type = 'table' ORDER BY rowid"),
        skip_table,
    )?;
    let shadows = shadow_tables(conn)?;
    for (_, name, sql) in tables.iter().filter(|(_, name, _)| !shadows.contains(name)) {
        writeln!(out, "{sql};")?;
        dump_rows(conn, out, name)?;
    }

    if table_exists(conn, "sqlite_sequence")? {
        writeln!(out, "DELETE FROM sqlite_sequence;")?;
        dump_rows(conn, out, "sqlite_sequence")?;
    }

    let others = query_objects(
        conn,
        &format!(
            "{USER_OBJECTS} AND type IN ('index', 'trigger', 'view') \
             AND sql IS NOT NULL ORDER BY rowid"
        ),
        skip_table,
    )?;
    for (_, _, sql) in &others {
        writeln!(out, "{sql};")?;
    }
    out.flush()?;
    Ok(())
}

/// Drop every user table and view except `keep_table`. Indexes and
/// triggers go with their tables.
pub(crate) fn drop_user_objects(conn: &Connection, keep_table: &str) -> Result<()> {
    let objects = query_objects(
        conn,
        &format!("{USER_OBJECTS} AND type IN ('table', 'view') ORDER BY rowid DESC"),
        keep_table,
    )?;
    // Shadow tables belong to their virtual table and go with it.
    let shadows = shadow_tables(conn)?;
    for (kind, name, _) in objects.into_iter().filter(|(_, name, _)| !shadows.contains(name)) {
        let kind = if kind == "view" { "VIEW" } else { "TABLE" };
        conn.execute_batch(&format!("DROP {kind} IF EXISTS {}", quote_identifier(&name)))
            .map_err(db_err("failed to drop schema object"))?;
    }
    if table_exists(conn, "sqlite_sequence")? {
        conn.execute_batch("DELETE FROM sqlite_sequence")
            .map_err(db_err("failed to clear sqlite_sequence"))?;
    }
    Ok(())
}

fn query_objects(conn: &Connection, sql: &str, table: &str) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("failed to read schema"))?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            ))
        })
        .map_err(db_err("failed to read schema"))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err("failed to read schema row"))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )
    .map_err(db_err("failed to inspect schema"))
}

/// Execute a dump read from `dump` one statement at a time, so only a single
/// statement is held in memory. Returns the number executed.
pub(crate) fn load_dump(conn: &Connection, dump: &mut dyn BufRead) -> Result<usize> {
    let mut splitter = StatementSplitter::default();
    let mut statements = Vec::new();
    let mut line = String::new();
    let mut executed = 0;
    loop {
        line.clear();
        if dump.read_line(&mut line)? == 0 {
            break;
        }
        splitter.feed(&line, &mut statements);
        for statement in statements.drain(..) {
            execute_loaded(conn, &statement)?;
            executed += 1;
        }
    }
    if let Some(statement) = splitter.finish() {
        execute_loaded(conn, &statement)?;
        executed += 1;
    }
    Ok(executed)
}

fn execute_loaded(conn: &Connection, statement: &str) -> Result<()> {
    conn.execute_batch(statement)
        .map_err(|e| Error::Database(format!("failed to load dump: {e}")))
}

/// Backing tables SQLite maintains for virtual tables (FTS, R*Tree). They
/// are rebuilt by the virtual table's own DDL, and their rows by inserting
/// through the virtual table.
fn shadow_tables(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_list WHERE schema = 'main' AND type = 'shadow'")
        .map_err(db_err("failed to list shadow tables"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err("failed to list shadow tables"))?;
    names
        .collect::<std::result::Result<HashSet<_>, _>>()
        .map_err(db_err("failed to read shadow table name"))
}

/// Columns that accept values on insert. Generated columns (`hidden` 2 and
/// 3) and hidden virtual table columns (`hidden` 1) are recomputed by SQLite.
fn storable_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_xinfo(?1) WHERE hidden = 0 ORDER BY cid")
        .map_err(db_err("failed to read columns"))?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(db_err("failed to read columns"))?;
    columns
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err("failed to read column name"))
}

fn dump_rows(conn: &Connection, out: &mut dyn Write, table: &str) -> Result<()> {
    let columns = storable_columns(conn, table)?;
    if columns.is_empty() {
        return Ok(());
    }
    let quoted = quote_identifier(table);
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(",");
    let mut stmt = conn
        .prepare(&format!("SELECT {column_list} FROM {quoted}"))
        .map_err(db_err("failed to prepare row dump"))?;
    let mut rows = stmt.query([]).map_err(db_err("failed to dump rows"))?;

    while let Some(row) = rows.next().map_err(db_err("failed to read row"))? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value = row.get_ref(idx).map_err(db_err("failed to read column"))?;
            values.push(sql_literal(value));
        }
        writeln!(
            out,
            "INSERT INTO {quoted}({column_list}) VALUES({});",
            values.join(",")
        )?;
    }
    Ok(())
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_infinite() => {
            let literal = if f > 0.0 { "9e999" } else { "-9e999" };
            literal.to_string()
        }
        ValueRef::Real(f) => format!("{f:?}"),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => format!("'{}'", text.replace('\'', "''")),
            // SQLite does not validate TEXT; keep the exact bytes.
            Err(_) => format!("CAST(X'{}' AS TEXT)", hex::encode(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode(bytes)),
    }
}
