use crate::error::{Result, SqlPhase, StorageError};
use crate::{check_gauge, check_name, MetricStorage, MetricsListing};
use pulsemon_common::retry::{retry_blocking, Backoff};
use pulsemon_common::types::format_gauge;
use rusqlite::types::FromSql;
use rusqlite::{Connection, OptionalExtension, ToSql, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const BACKEND: &str = "relational";

const GAUGE_TABLE: &str = "gauge_metrics";
const COUNTER_TABLE: &str = "counter_metrics";

const SCHEMA: [(&str, &str); 2] = [
    (
        GAUGE_TABLE,
        "CREATE TABLE gauge_metrics (
            name  TEXT NOT NULL UNIQUE,
            value REAL NOT NULL
        )",
    ),
    (
        COUNTER_TABLE,
        "CREATE TABLE counter_metrics (
            name  TEXT NOT NULL UNIQUE,
            value INTEGER NOT NULL
        )",
    ),
];

// Rows per multi-row statement, well under SQLite's bound parameter limit.
const ROWS_PER_STATEMENT: usize = 500;

/// Where a DSN points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Memory,
    File(PathBuf),
}

fn parse_dsn(dsn: &str) -> Result<Location> {
    let dsn = dsn.trim();
    let rest = match dsn.split_once("://") {
        Some(("sqlite", rest)) => rest,
        Some(_) => return Err(StorageError::InvalidDsn(dsn.to_string())),
        None => dsn.strip_prefix("sqlite:").unwrap_or(dsn),
    };
    match rest {
        "" => Err(StorageError::InvalidDsn(dsn.to_string())),
        ":memory:" => Ok(Location::Memory),
        path => Ok(Location::File(PathBuf::from(path))),
    }
}

/// Relational backend over a single SQLite connection.
///
/// Each metric is one row keyed by a unique name. Single puts are a lookup
/// followed by an INSERT or UPDATE, which can race with another process
/// writing the same database; batches run entirely inside one transaction.
pub struct SqlStorage {
    conn: Mutex<Connection>,
}

impl SqlStorage {
    /// Opens the database behind `dsn` and checks that it answers.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, a plain path or `:memory:`.
    pub fn connect(dsn: &str) -> Result<Self> {
        let conn = match parse_dsn(dsn)? {
            Location::Memory => Connection::open_in_memory().map_err(StorageError::Unreachable)?,
            Location::File(path) => {
                let conn = Connection::open(&path).map_err(StorageError::Unreachable)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")
                    .map_err(StorageError::Unreachable)?;
                conn
            }
        };
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(StorageError::Unreachable)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.ping()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates whichever metric tables are missing, retrying with the default
    /// backoff. Returns the names of the tables it created.
    pub fn init_schema(&self) -> Result<Vec<&'static str>> {
        self.init_schema_with(Backoff::default())
    }

    pub fn init_schema_with(&self, backoff: Backoff) -> Result<Vec<&'static str>> {
        retry_blocking(backoff, || self.create_missing_tables())
    }

    fn create_missing_tables(&self) -> Result<Vec<&'static str>> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(StorageError::backend(SqlPhase::Begin, "schema"))?;

        let mut created = Vec::new();
        for (table, ddl) in SCHEMA {
            let exists: bool = tx
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .map_err(StorageError::backend(SqlPhase::Query, table))?;
            if !exists {
                tx.execute_batch(ddl)
                    .map_err(StorageError::backend(SqlPhase::Exec, table))?;
                created.push(table);
            }
        }

        tx.commit()
            .map_err(StorageError::backend(SqlPhase::Commit, "schema"))?;
        Ok(created)
    }

    fn get_value<V: FromSql>(&self, table: &'static str, name: &str) -> Result<Option<V>> {
        lookup(&self.conn(), table, name)
    }

    /// Lookup, then INSERT or UPDATE with `combine(existing, incoming)`.
    ///
    /// Both statements run under the connection lock, so writers in this
    /// process never interleave; another process sharing the file can still
    /// slip in between them.
    fn upsert_one<V, F>(&self, table: &'static str, name: &str, incoming: V, combine: F) -> Result<()>
    where
        V: ToSql + FromSql + Copy,
        F: Fn(&str, Option<V>, V) -> Result<V>,
    {
        check_name(name)?;
        let conn = self.conn();
        let existing: Option<V> = lookup(&conn, table, name)?;
        let value = combine(name, existing, incoming)?;

        let sql = match existing {
            Some(_) => format!("UPDATE {table} SET value = ?2 WHERE name = ?1"),
            None => format!("INSERT INTO {table} (name, value) VALUES (?1, ?2)"),
        };
        conn.execute(&sql, rusqlite::params![name, value])
            .map_err(StorageError::backend(SqlPhase::Exec, table))?;
        Ok(())
    }

    /// Applies a whole batch in one transaction.
    ///
    /// Every name is looked up first and split into rows to insert and rows to
    /// update; each group is written with multi-row statements whose affected
    /// row count must match the group size, otherwise nothing is committed.
    fn upsert_batch<V, F>(&self, table: &'static str, batch: &HashMap<String, V>, combine: F) -> Result<()>
    where
        V: ToSql + FromSql + Copy,
        F: Fn(&str, Option<V>, V) -> Result<V>,
    {
        if batch.is_empty() {
            return Ok(());
        }
        for name in batch.keys() {
            check_name(name)?;
        }
        let ordered: BTreeMap<&str, V> = batch.iter().map(|(k, v)| (k.as_str(), *v)).collect();

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::backend(SqlPhase::Begin, table))?;

        let mut inserts: Vec<(&str, V)> = Vec::new();
        let mut updates: Vec<(&str, V)> = Vec::new();
        for (name, incoming) in ordered {
            let existing: Option<V> = lookup(&tx, table, name)?;
            let value = combine(name, existing, incoming)?;
            match existing {
                Some(_) => updates.push((name, value)),
                None => inserts.push((name, value)),
            }
        }

        for chunk in inserts.chunks(ROWS_PER_STATEMENT) {
            let sql = format!(
                "INSERT INTO {table} (name, value) VALUES {}",
                placeholders(chunk.len())
            );
            execute_checked(&tx, table, &sql, chunk)?;
        }
        for chunk in updates.chunks(ROWS_PER_STATEMENT) {
            let sql = format!(
                "UPDATE {table} AS t SET value = v.column2 \
                 FROM (VALUES {}) AS v WHERE t.name = v.column1",
                placeholders(chunk.len())
            );
            execute_checked(&tx, table, &sql, chunk)?;
        }

        tx.commit()
            .map_err(StorageError::backend(SqlPhase::Commit, table))
    }

    fn list<V: FromSql>(&self, table: &'static str) -> Result<Vec<(String, V)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(&format!("SELECT name, value FROM {table} ORDER BY name"))
            .map_err(StorageError::backend(SqlPhase::Query, table))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(StorageError::backend(SqlPhase::Query, table))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::backend(SqlPhase::Query, table))
    }
}

fn lookup<V: FromSql>(conn: &Connection, table: &'static str, name: &str) -> Result<Option<V>> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT value FROM {table} WHERE name = ?1"))
        .map_err(StorageError::backend(SqlPhase::Query, table))?;
    stmt.query_row([name], |row| row.get(0))
        .optional()
        .map_err(StorageError::backend(SqlPhase::Query, table))
}

/// `(?1, ?2), (?3, ?4), ...` for `rows` name/value pairs.
fn placeholders(rows: usize) -> String {
    (0..rows)
        .map(|i| format!("(?{}, ?{})", 2 * i + 1, 2 * i + 2))
        .collect::<Vec<_>>()
        .join(", ")
}

fn execute_checked<V: ToSql>(
    tx: &rusqlite::Transaction<'_>,
    table: &'static str,
    sql: &str,
    rows: &[(&str, V)],
) -> Result<()> {
    let params: Vec<&dyn ToSql> = rows
        .iter()
        .flat_map(|(name, value)| [name as &dyn ToSql, value as &dyn ToSql])
        .collect();
    let affected = tx
        .execute(sql, params.as_slice())
        .map_err(StorageError::backend(SqlPhase::Exec, table))?;
    if affected != rows.len() {
        return Err(StorageError::Consistency {
            table,
            expected: rows.len(),
            affected,
        });
    }
    Ok(())
}

fn replace<V>(_name: &str, _existing: Option<V>, incoming: V) -> Result<V> {
    Ok(incoming)
}

fn accumulate(name: &str, existing: Option<i64>, delta: i64) -> Result<i64> {
    existing
        .unwrap_or(0)
        .checked_add(delta)
        .ok_or_else(|| StorageError::CounterOverflow {
            name: name.to_string(),
        })
}

impl MetricStorage for SqlStorage {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn get_gauge(&self, name: &str) -> Result<Option<f64>> {
        self.get_value(GAUGE_TABLE, name)
    }

    fn put_gauge(&self, name: &str, value: f64) -> Result<()> {
        check_gauge(name, value)?;
        self.upsert_one(GAUGE_TABLE, name, value, replace)
    }

    fn get_counter(&self, name: &str) -> Result<Option<i64>> {
        self.get_value(COUNTER_TABLE, name)
    }

    fn put_counter(&self, name: &str, delta: i64) -> Result<()> {
        self.upsert_one(COUNTER_TABLE, name, delta, accumulate)
    }

    fn put_gauges(&self, batch: &HashMap<String, f64>) -> Result<()> {
        for (name, value) in batch {
            check_gauge(name, *value)?;
        }
        self.upsert_batch(GAUGE_TABLE, batch, replace)
    }

    fn put_counters(&self, batch: &HashMap<String, i64>) -> Result<()> {
        self.upsert_batch(COUNTER_TABLE, batch, accumulate)
    }

    fn get_all(&self) -> Result<MetricsListing> {
        let gauges = self
            .list::<f64>(GAUGE_TABLE)?
            .into_iter()
            .map(|(name, value)| (name, format_gauge(value)))
            .collect();
        let counters = self
            .list::<i64>(COUNTER_TABLE)?
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        Ok(MetricsListing { gauges, counters })
    }

    fn ping(&self) -> Result<()> {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(StorageError::Unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_file(dir: &TempDir) -> (PathBuf, SqlStorage) {
        let path = dir.path().join("metrics.db");
        let storage = SqlStorage::connect(&format!("sqlite://{}", path.display())).unwrap();
        storage.init_schema().unwrap();
        (path, storage)
    }

    #[test]
    fn parse_dsn_forms() {
        assert_eq!(parse_dsn(":memory:").unwrap(), Location::Memory);
        assert_eq!(parse_dsn("sqlite://:memory:").unwrap(), Location::Memory);
        assert_eq!(
            parse_dsn("sqlite:///var/lib/metrics.db").unwrap(),
            Location::File(PathBuf::from("/var/lib/metrics.db"))
        );
        assert_eq!(
            parse_dsn("data/metrics.db").unwrap(),
            Location::File(PathBuf::from("data/metrics.db"))
        );
        assert!(matches!(
            parse_dsn("postgres://user@localhost/metrics"),
            Err(StorageError::InvalidDsn(_))
        ));
        assert!(matches!(parse_dsn("  "), Err(StorageError::InvalidDsn(_))));
    }

    #[test]
    fn connect_to_missing_directory_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let dsn = dir.path().join("no").join("such").join("metrics.db");
        let err = SqlStorage::connect(&dsn.display().to_string()).err().unwrap();
        assert!(matches!(err, StorageError::Unreachable(_)));
    }

    #[test]
    fn init_schema_is_idempotent() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        assert_eq!(storage.init_schema().unwrap(), vec![GAUGE_TABLE, COUNTER_TABLE]);
        assert!(storage.init_schema().unwrap().is_empty());
    }

    #[test]
    fn init_schema_creates_only_missing_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE gauge_metrics (name TEXT NOT NULL UNIQUE, value REAL NOT NULL);
                 INSERT INTO gauge_metrics (name, value) VALUES ('kept', 4.5);",
            )
            .unwrap();
        }
        let storage = SqlStorage::connect(&path.display().to_string()).unwrap();
        assert_eq!(storage.init_schema().unwrap(), vec![COUNTER_TABLE]);
        assert_eq!(storage.get_gauge("kept").unwrap(), Some(4.5));
    }

    #[test]
    fn failed_table_creation_rolls_back_the_whole_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE VIEW counter_metrics AS SELECT 1 AS name, 2 AS value;")
                .unwrap();
        }
        let storage = SqlStorage::connect(&path.display().to_string()).unwrap();

        let err = storage.init_schema_with(Backoff::none()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Backend {
                phase: SqlPhase::Exec,
                table: COUNTER_TABLE,
                ..
            }
        ));

        let gauge_tables: i64 = storage
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [GAUGE_TABLE],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(gauge_tables, 0);
    }

    #[test]
    fn single_puts_replace_and_accumulate() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        storage.init_schema().unwrap();

        storage.put_gauge("Alloc", 1.0).unwrap();
        storage.put_gauge("Alloc", 2.5).unwrap();
        assert_eq!(storage.get_gauge("Alloc").unwrap(), Some(2.5));

        storage.put_counter("PollCount", 3).unwrap();
        storage.put_counter("PollCount", 4).unwrap();
        assert_eq!(storage.get_counter("PollCount").unwrap(), Some(7));
        assert_eq!(storage.get_counter("Alloc").unwrap(), None);
    }

    #[test]
    fn batch_mixes_inserts_and_updates() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        storage.init_schema().unwrap();
        storage.put_counter("a", 10).unwrap();

        let batch: HashMap<String, i64> = [("a".to_string(), 5), ("b".to_string(), 7)].into();
        storage.put_counters(&batch).unwrap();
        assert_eq!(storage.get_counter("a").unwrap(), Some(15));
        assert_eq!(storage.get_counter("b").unwrap(), Some(7));

        let gauges: HashMap<String, f64> = [("x".to_string(), 0.5), ("y".to_string(), -1.0)].into();
        storage.put_gauges(&gauges).unwrap();
        storage.put_gauges(&[("x".to_string(), 9.0)].into()).unwrap();
        let all = storage.get_all().unwrap();
        assert_eq!(all.gauges.get("x").map(String::as_str), Some("9"));
        assert_eq!(all.gauges.get("y").map(String::as_str), Some("-1"));
        assert_eq!(all.counters.get("a").map(String::as_str), Some("15"));
    }

    #[test]
    fn large_batch_spans_several_statements() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        storage.init_schema().unwrap();
        let batch: HashMap<String, i64> = (0..1200).map(|i| (format!("m{i}"), i)).collect();
        storage.put_counters(&batch).unwrap();
        storage.put_counters(&batch).unwrap();
        assert_eq!(storage.get_counter("m1199").unwrap(), Some(2398));
        assert_eq!(storage.get_all().unwrap().counters.len(), 1200);
    }

    #[test]
    fn short_affected_count_rolls_back_batch() {
        let dir = TempDir::new().unwrap();
        let (path, storage) = open_file(&dir);
        storage.put_gauge("a", 1.0).unwrap();
        storage.put_gauge("b", 2.0).unwrap();
        storage.put_gauge("control", 9.0).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TRIGGER skip_b BEFORE UPDATE ON gauge_metrics
                 WHEN NEW.name = 'b' BEGIN SELECT RAISE(IGNORE); END;",
            )
            .unwrap();
        }

        let batch: HashMap<String, f64> = [
            ("a".to_string(), 10.0),
            ("b".to_string(), 20.0),
            ("new".to_string(), 30.0),
        ]
        .into();
        let err = storage.put_gauges(&batch).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Consistency {
                table: GAUGE_TABLE,
                expected: 2,
                affected: 1
            }
        ));

        assert_eq!(storage.get_gauge("a").unwrap(), Some(1.0));
        assert_eq!(storage.get_gauge("b").unwrap(), Some(2.0));
        assert_eq!(storage.get_gauge("new").unwrap(), None);
        assert_eq!(storage.get_gauge("control").unwrap(), Some(9.0));
    }

    #[test]
    fn counter_batch_overflow_rolls_back() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        storage.init_schema().unwrap();
        storage.put_counter("big", i64::MAX).unwrap();
        let batch: HashMap<String, i64> = [("aaa".to_string(), 1), ("big".to_string(), 1)].into();
        assert!(matches!(
            storage.put_counters(&batch),
            Err(StorageError::CounterOverflow { .. })
        ));
        assert_eq!(storage.get_counter("aaa").unwrap(), None);
    }

    #[test]
    fn missing_table_reports_query_phase() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        let err = storage.get_gauge("x").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Backend {
                phase: SqlPhase::Query,
                table: GAUGE_TABLE,
                ..
            }
        ));
        assert!(err.to_string().contains("query failed on gauge_metrics"));
    }

    #[test]
    fn ping_and_backend_name() {
        let storage = SqlStorage::connect(":memory:").unwrap();
        storage.ping().unwrap();
        assert_eq!(storage.backend(), "relational");
    }

    #[test]
    fn data_survives_reconnect() {
        let dir = TempDir::new().unwrap();
        let (path, storage) = open_file(&dir);
        storage.put_counter("PollCount", 5).unwrap();
        drop(storage);

        let reopened = SqlStorage::connect(&path.display().to_string()).unwrap();
        assert!(reopened.init_schema().unwrap().is_empty());
        assert_eq!(reopened.get_counter("PollCount").unwrap(), Some(5));
    }
}
