//! Schema-evolving SQLite backend.
//!
//! One table per (normalized) source name. The first record for a source
//! defines the table; later records with unseen fields extend it with
//! `ALTER TABLE ... ADD COLUMN`. Columns are never dropped or retyped.
//!
//! ```text
//! write(record, "energy")
//!     │  acquire destination lock (shared by every instance on this file)
//!     ▼
//! spawn_blocking ── BEGIN
//!                   table exists? ── no ──► CREATE TABLE (record keys, inferred types)
//!                        │ yes
//!                        ▼
//!                   PRAGMA table_info ─► ADD COLUMN for each unseen key
//!                   INSERT (bound parameters)
//!                   COMMIT ── release lock
//! ```
use super::{destination_lock, normalize_source_name, resolve_destination, Backend, DestinationLock};
use crate::error::{AppResult, MesuraError};
use crate::record::{FieldValue, Record};
use async_trait::async_trait;
use rusqlite::types::{Null, ToSql, ToSqlOutput};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// What a single write did to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record had no fields; nothing was touched.
    Skipped,
    /// The table did not exist and was created with this many columns.
    Created { columns: usize },
    /// The row was appended; lists the columns that had to be added first.
    Appended { added_columns: Vec<String> },
}

/// SQLite column affinity chosen for a value.
pub fn column_type(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Integer(_) => "INTEGER",
        FieldValue::Real(_) => "REAL",
        FieldValue::Text(_) | FieldValue::Null => "TEXT",
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Integer(i) => ToSqlOutput::from(*i),
            FieldValue::Real(r) => ToSqlOutput::from(*r),
            FieldValue::Text(s) => ToSqlOutput::from(s.as_str()),
            FieldValue::Null => ToSqlOutput::from(Null),
        })
    }
}

/// Backend writing every source into its own table of one database file.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    lock: DestinationLock,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path` and switches it to WAL mode.
    ///
    /// The parent directory is created if needed. Instances built for the same
    /// file share one write lock.
    pub fn new(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = resolve_destination(path.as_ref())?;
        let conn = open_connection(&path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        info!("SQLite backend ready at '{}' (journal_mode={})", path.display(), mode);

        Ok(Self {
            lock: destination_lock(&path),
            path,
        })
    }

    /// Absolute path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `record` and reports what happened, without swallowing errors.
    #[instrument(skip(self, record), fields(db = %self.path.display(), fields = record.len()))]
    pub async fn try_write(&self, record: &Record, source_name: &str) -> AppResult<WriteOutcome> {
        if record.is_empty() {
            debug!("Empty record for '{}', nothing to write", source_name);
            return Ok(WriteOutcome::Skipped);
        }

        let table = normalize_source_name(source_name);
        let path = self.path.clone();
        let record = record.clone();

        // The owned guard travels into the blocking task so the lock is only
        // released once the transaction has finished, even if this future is
        // dropped while waiting on it.
        let guard = self.lock.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            append_row(&path, &table, &record)
        })
        .await?
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write(&self, record: &Record, source_name: &str) -> AppResult<()> {
        match self.try_write(record, source_name).await {
            Ok(WriteOutcome::Created { columns }) => {
                info!("Created table '{}' with {} columns", normalize_source_name(source_name), columns);
            }
            Ok(WriteOutcome::Appended { added_columns }) if !added_columns.is_empty() => {
                info!(
                    "Extended table '{}' with columns {:?}",
                    normalize_source_name(source_name),
                    added_columns
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(source = source_name, db = %self.path.display(), "Error writing to SQLite: {}", e);
            }
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Lower-cased column names of `table`, or `None` when it does not exist.
fn existing_columns(conn: &Connection, table: &str) -> AppResult<Option<HashSet<String>>> {
    let exists = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .map(|name| name.map(|n| n.to_lowercase()))
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(Some(columns))
}

fn create_table_sql(table: &str, record: &Record) -> String {
    let columns = record
        .iter()
        .map(|(key, value)| format!("{} {}", quote_identifier(key), column_type(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", quote_identifier(table), columns)
}

fn insert_sql(table: &str, record: &Record) -> String {
    let columns = record.keys().map(quote_identifier).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; record.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        columns,
        placeholders
    )
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.to_ascii_lowercase().contains("duplicate column")
    )
}

/// Adds `column`; returns `false` if another writer already added it.
fn add_column(conn: &Connection, table: &str, column: &str, value: &FieldValue) -> AppResult<bool> {
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(table),
        quote_identifier(column),
        column_type(value)
    );
    match conn.execute(&sql, []) {
        Ok(_) => Ok(true),
        Err(e) if is_duplicate_column(&e) => {
            debug!("Column '{}' already present in '{}'", column, table);
            Ok(false)
        }
        Err(e) => Err(MesuraError::from(e)),
    }
}

fn append_row(path: &Path, table: &str, record: &Record) -> AppResult<WriteOutcome> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction()?;

    let outcome = match existing_columns(&tx, table)? {
        None => {
            tx.execute(&create_table_sql(table, record), [])?;
            WriteOutcome::Created {
                columns: record.len(),
            }
        }
        Some(columns) => {
            let mut added_columns = Vec::new();
            for (key, value) in record.iter() {
                if !columns.contains(&key.to_lowercase()) && add_column(&tx, table, key, value)? {
                    added_columns.push(key.to_string());
                }
            }
            WriteOutcome::Appended { added_columns }
        }
    };

    tx.execute(&insert_sql(table, record), params_from_iter(record.values()))?;
    tx.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn infers_column_types() {
        assert_eq!(column_type(&FieldValue::Integer(1)), "INTEGER");
        assert_eq!(column_type(&FieldValue::Real(1.5)), "REAL");
        assert_eq!(column_type(&FieldValue::Text("x".into())), "TEXT");
        assert_eq!(column_type(&FieldValue::Null), "TEXT");
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("a.b"), "\"a.b\"");
        assert_eq!(quote_identifier("c[0]"), "\"c[0]\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn create_statement_follows_record_order() {
        let r = record(&[
            ("timestamp", FieldValue::Text("t".into())),
            ("active_tariff", FieldValue::Integer(1)),
            ("t1_kwh", FieldValue::Real(10.5)),
        ]);
        assert_eq!(
            create_table_sql("energy", &r),
            "CREATE TABLE \"energy\" (\"timestamp\" TEXT, \"active_tariff\" INTEGER, \"t1_kwh\" REAL)"
        );
        assert_eq!(
            insert_sql("energy", &r),
            "INSERT INTO \"energy\" (\"timestamp\", \"active_tariff\", \"t1_kwh\") VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn duplicate_column_is_not_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE \"t\" (\"a\" INTEGER)", []).unwrap();

        assert!(add_column(&conn, "t", "b", &FieldValue::Real(1.0)).unwrap());
        assert!(!add_column(&conn, "t", "b", &FieldValue::Real(1.0)).unwrap());
        assert!(add_column(&conn, "missing", "b", &FieldValue::Real(1.0)).is_err());
    }

    #[tokio::test]
    async fn creates_then_extends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("test.db")).unwrap();

        let first = record(&[("val", FieldValue::Real(1.5))]);
        assert_eq!(
            backend.try_write(&first, "test-source").await.unwrap(),
            WriteOutcome::Created { columns: 1 }
        );

        let second = record(&[("val", FieldValue::Real(2.0)), ("extra", FieldValue::Integer(7))]);
        assert_eq!(
            backend.try_write(&second, "test-source").await.unwrap(),
            WriteOutcome::Appended {
                added_columns: vec!["extra".into()]
            }
        );

        let conn = Connection::open(backend.path()).unwrap();
        let total: i64 = conn
            .query_row("SELECT count(*) FROM test_source", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn empty_record_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("empty.db")).unwrap();
        assert_eq!(
            backend.try_write(&Record::new(), "energy").await.unwrap(),
            WriteOutcome::Skipped
        );

        let conn = Connection::open(backend.path()).unwrap();
        let tables: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master WHERE type = 'table'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[tokio::test]
    async fn text_is_bound_not_interpolated() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("inject.db")).unwrap();
        let nasty = "x'); DROP TABLE energy; --";
        backend
            .try_write(&record(&[("note", FieldValue::Text(nasty.into()))]), "energy")
            .await
            .unwrap();

        let conn = Connection::open(backend.path()).unwrap();
        let stored: String = conn
            .query_row("SELECT note FROM energy", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, nasty);
    }

    #[tokio::test]
    async fn write_swallows_storage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("broken.db")).unwrap();
        backend
            .try_write(&record(&[("a", FieldValue::Integer(1))]), "src")
            .await
            .unwrap();

        // Replace the database with something that is not SQLite.
        std::fs::write(backend.path(), b"definitely not a database file, just text padding").unwrap();
        let _ = std::fs::remove_file(backend.path().with_extension("db-wal"));
        let _ = std::fs::remove_file(backend.path().with_extension("db-shm"));

        let r = record(&[("a", FieldValue::Integer(2))]);
        assert!(backend.try_write(&r, "src").await.is_err());
        assert!(backend.write(&r, "src").await.is_ok());
    }
}
