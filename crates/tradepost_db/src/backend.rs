//! DuckDB connection wrapper.
//!
//! - Synchronous: every call runs to completion on the caller's thread
//! - Single writer per database file, enforced by [`WriterLock`]
//! - Closure-scoped transactions: `Ok` commits, `Err` rolls back

use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use duckdb::types::{ToSql, ToSqlOutput, Value, ValueRef};
use thiserror::Error;
use tracing::{debug_span, info, warn};

use crate::lock::{LockError, WriterLock};

/// Parameters bound per INSERT statement in [`DbTransaction::bulk_insert_rows`].
const MAX_BOUND_PARAMS: usize = 999;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database is locked: {0}")]
    Locked(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Operation requires write access but the database is open read-only")]
    ReadOnly,

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

impl From<LockError> for BackendError {
    fn from(err: LockError) -> Self {
        match err {
            held @ LockError::Held { .. } => BackendError::Locked(held.to_string()),
            other => BackendError::Lock(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Holds the writer lock.
    ReadWrite,
    /// Sees the last committed snapshot; coexists with the writer.
    ReadOnly,
}

/// A bound parameter or a decoded result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

macro_rules! db_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DbValue {
                fn from(v: $ty) -> Self {
                    DbValue::$variant(v.into())
                }
            }
        )*
    };
}

db_value_from!(i32 => Integer, i64 => Integer, f64 => Real, String => Text, bool => Boolean);

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DbValue::Null, Into::into)
    }
}

impl ToSql for DbValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(match self {
            DbValue::Null => ToSqlOutput::Owned(Value::Null),
            DbValue::Integer(v) => ToSqlOutput::Owned(Value::BigInt(*v)),
            DbValue::Real(v) => ToSqlOutput::Owned(Value::Double(*v)),
            DbValue::Text(v) => ToSqlOutput::Owned(Value::Text(v.clone())),
            DbValue::Boolean(v) => ToSqlOutput::Owned(Value::Boolean(*v)),
        })
    }
}

impl DbValue {
    fn decode(cell: ValueRef<'_>, column: usize) -> Result<Self, BackendError> {
        let out_of_range = |v: &dyn std::fmt::Display| {
            BackendError::TypeConversion(format!("Column {column}: {v} exceeds i64"))
        };
        Ok(match cell {
            ValueRef::Null => DbValue::Null,
            ValueRef::Boolean(v) => DbValue::Boolean(v),
            ValueRef::TinyInt(v) => DbValue::Integer(v.into()),
            ValueRef::SmallInt(v) => DbValue::Integer(v.into()),
            ValueRef::Int(v) => DbValue::Integer(v.into()),
            ValueRef::BigInt(v) => DbValue::Integer(v),
            ValueRef::HugeInt(v) => {
                DbValue::Integer(i64::try_from(v).map_err(|_| out_of_range(&v))?)
            }
            ValueRef::UTinyInt(v) => DbValue::Integer(v.into()),
            ValueRef::USmallInt(v) => DbValue::Integer(v.into()),
            ValueRef::UInt(v) => DbValue::Integer(v.into()),
            ValueRef::UBigInt(v) => {
                DbValue::Integer(i64::try_from(v).map_err(|_| out_of_range(&v))?)
            }
            ValueRef::Float(v) => DbValue::Real(v.into()),
            ValueRef::Double(v) => DbValue::Real(v),
            ValueRef::Text(bytes) => DbValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            other => {
                return Err(BackendError::TypeConversion(format!(
                    "Column {column}: unsupported DuckDB type {:?}",
                    other.data_type()
                )))
            }
        })
    }
}

/// One result row, addressed by column position.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRow(Vec<DbValue>);

impl DbRow {
    pub fn new(values: Vec<DbValue>) -> Self {
        Self(values)
    }

    /// Decode column `index`. NULL only decodes into an `Option`.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        let value = self.0.get(index).ok_or_else(|| {
            BackendError::TypeConversion(format!(
                "Column {} out of bounds ({} columns)",
                index,
                self.0.len()
            ))
        })?;
        T::from_db_value(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

fn mismatch(expected: &str, found: &DbValue) -> BackendError {
    match found {
        DbValue::Null => BackendError::TypeConversion(format!(
            "Expected {expected}, found NULL (decode nullable columns as Option)"
        )),
        other => BackendError::TypeConversion(format!("Expected {expected}, found {other:?}")),
    }
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            other => Err(mismatch("integer", other)),
        }
    }
}

impl FromDbValue for i32 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        let wide = i64::from_db_value(value)?;
        i32::try_from(wide)
            .map_err(|_| BackendError::TypeConversion(format!("{wide} does not fit in i32")))
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            other => Err(mismatch("real", other)),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            other => Err(mismatch("text", other)),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            other => Err(mismatch("boolean", other)),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            present => T::from_db_value(present).map(Some),
        }
    }
}

/// Handle on one ledger database.
///
/// Clones share the underlying connection and, for writers, the lock.
#[derive(Clone)]
pub struct DbConnection {
    conn: Rc<duckdb::Connection>,
    access_mode: AccessMode,
    _writer_lock: Option<Rc<WriterLock>>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("access_mode", &self.access_mode)
            .finish()
    }
}

impl DbConnection {
    /// Open for writing. Fails at once with [`BackendError::Locked`] when
    /// another process is the writer.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let lock = WriterLock::acquire(path)?;
        let conn = duckdb::Connection::open(path)?;
        info!(path = %path.display(), "Opened ledger database for writing");
        Ok(Self {
            conn: Rc::new(conn),
            access_mode: AccessMode::ReadWrite,
            _writer_lock: Some(Rc::new(lock)),
        })
    }

    /// Open an existing database read-only. Takes no lock.
    pub fn open_readonly(path: &Path) -> Result<Self, BackendError> {
        let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
        let conn = duckdb::Connection::open_with_flags(path, config)?;
        info!(path = %path.display(), "Opened ledger database read-only");
        Ok(Self {
            conn: Rc::new(conn),
            access_mode: AccessMode::ReadOnly,
            _writer_lock: None,
        })
    }

    /// Private in-memory database; writable, unlocked.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Ok(Self {
            conn: Rc::new(duckdb::Connection::open_in_memory()?),
            access_mode: AccessMode::ReadWrite,
            _writer_lock: None,
        })
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn is_writable(&self) -> bool {
        self.access_mode == AccessMode::ReadWrite
    }

    fn ensure_writable(&self) -> Result<(), BackendError> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BackendError::ReadOnly)
        }
    }

    /// Run one statement outside any explicit transaction.
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        self.ensure_writable()?;
        run_execute(&self.conn, sql, params)
    }

    /// Run semicolon-separated DDL.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        self.ensure_writable()?;
        let span = debug_span!("db.batch", duration_ms = tracing::field::Empty);
        let _entered = span.enter();
        let start = Instant::now();
        self.conn.execute_batch(sql)?;
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        Ok(())
    }

    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        run_query(&self.conn, sql, params)
    }

    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        Ok(run_query(&self.conn, sql, params)?.into_iter().next())
    }

    /// First column of the first row; no row is an error.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        first_cell(run_query(&self.conn, sql, params)?)
    }

    /// Run `op` inside one transaction.
    ///
    /// `Ok` commits. `Err` rolls back and is returned unchanged; only a
    /// failed rollback replaces it.
    pub fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut DbTransaction<'_>) -> Result<T, E>,
        E: From<BackendError> + std::fmt::Display,
    {
        self.ensure_writable()?;
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(BackendError::from)?;

        let mut tx = DbTransaction { conn: &self.conn };
        match op(&mut tx) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT").map_err(BackendError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "Rollback failed");
                    return Err(BackendError::Transaction(format!(
                        "{err}; rollback also failed: {rollback}"
                    ))
                    .into());
                }
                Err(err)
            }
        }
    }
}

/// An open transaction, only reachable inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl DbTransaction<'_> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        run_execute(self.conn, sql, params)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        run_query(self.conn, sql, params)
    }

    pub fn query_optional(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        Ok(run_query(self.conn, sql, params)?.into_iter().next())
    }

    pub fn query_scalar<T: FromDbValue>(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        first_cell(run_query(self.conn, sql, params)?)
    }

    /// Draw the next id from a sequence.
    pub fn next_sequence_value(&mut self, sequence: &str) -> Result<i64, BackendError> {
        if !sequence.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BackendError::InvalidInput(format!(
                "Invalid sequence name: {sequence}"
            )));
        }
        self.query_scalar(&format!("SELECT nextval('{sequence}')"), &[])
    }

    /// Insert `rows` into `table` with multi-row VALUES statements.
    ///
    /// Each row lists its values in `columns` order.
    pub fn bulk_insert_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if columns.is_empty() || columns.len() > MAX_BOUND_PARAMS {
            return Err(BackendError::InvalidInput(format!(
                "bulk insert into {table} needs 1..={MAX_BOUND_PARAMS} columns, got {}",
                columns.len()
            )));
        }
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(BackendError::InvalidInput(format!(
                "Row {index} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

        let mut inserted = 0;
        for batch in rows.chunks(MAX_BOUND_PARAMS / columns.len()) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list,
                vec![placeholders.as_str(); batch.len()].join(", ")
            );
            let params: Vec<DbValue> = batch.iter().flatten().cloned().collect();
            inserted += run_execute(self.conn, &sql, &params)?;
        }
        Ok(inserted)
    }
}

fn statement_kind(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("?")
}

fn run_execute(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let span = debug_span!(
        "db.execute",
        kind = statement_kind(sql),
        rows = tracing::field::Empty,
        duration_ms = tracing::field::Empty
    );
    let _entered = span.enter();
    let start = Instant::now();

    let affected = conn
        .prepare(sql)?
        .execute(duckdb::params_from_iter(params.iter()))? as u64;

    span.record("rows", affected);
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(affected)
}

fn run_query(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "db.query",
        kind = statement_kind(sql),
        rows = tracing::field::Empty,
        duration_ms = tracing::field::Empty
    );
    let _entered = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(params.iter()))?;
    let width = rows.as_ref().map_or(0, |s| s.column_count());

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let cells = (0..width)
            .map(|i| DbValue::decode(row.get_ref(i)?, i))
            .collect::<Result<Vec<_>, BackendError>>()?;
        out.push(DbRow::new(cells));
    }

    span.record("rows", out.len() as u64);
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(out)
}

fn first_cell<T: FromDbValue>(rows: Vec<DbRow>) -> Result<T, BackendError> {
    rows.first()
        .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?
        .get(0)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> DbConnection {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT, ok BOOLEAN)")
            .unwrap();
        conn
    }

    fn count(conn: &DbConnection) -> i64 {
        conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap()
    }

    #[test]
    fn bulk_insert_spans_several_statements() {
        let conn = memory_conn();
        let rows: Vec<Vec<DbValue>> = (0..1_000_i64)
            .map(|i| vec![i.into(), format!("row-{i}").into(), (i % 2 == 0).into()])
            .collect();
        let inserted = conn
            .transaction(|tx| tx.bulk_insert_rows("t", &["id", "name", "ok"], &rows))
            .unwrap();

        assert_eq!(inserted, 1_000);
        assert_eq!(count(&conn), 1_000);
        let max: i64 = conn.query_scalar("SELECT MAX(id) FROM t", &[]).unwrap();
        assert_eq!(max, 999);
    }

    #[test]
    fn bulk_insert_rejects_ragged_rows() {
        let conn = memory_conn();
        let rows = vec![vec![DbValue::from(1_i64)]];
        let err = conn
            .transaction(|tx| tx.bulk_insert_rows("t", &["id", "name"], &rows))
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[test]
    fn err_from_closure_rolls_back() {
        let conn = memory_conn();
        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t (id, name) VALUES (?, ?)", &[1_i64.into(), "gone".into()])?;
            Err(BackendError::InvalidInput("abort".to_string()))
        });

        assert!(matches!(result, Err(BackendError::InvalidInput(_))));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn ok_from_closure_commits() {
        let conn = memory_conn();
        conn.transaction(|tx| {
            tx.execute(
                "INSERT INTO t (id, name, ok) VALUES (?, ?, ?)",
                &[7_i64.into(), DbValue::Null, true.into()],
            )
        })
        .unwrap();

        let row = conn
            .query_optional("SELECT id, name, ok FROM t", &[])
            .unwrap()
            .unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get::<Option<String>>(1).unwrap(), None);
        assert!(row.get::<bool>(2).unwrap());
    }

    #[test]
    fn sequences_hand_out_increasing_ids() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE SEQUENCE seq_test").unwrap();
        let (a, b) = conn
            .transaction(|tx| {
                Ok::<_, BackendError>((
                    tx.next_sequence_value("seq_test")?,
                    tx.next_sequence_value("seq_test")?,
                ))
            })
            .unwrap();
        assert!(b > a);

        let err = conn
            .transaction(|tx| tx.next_sequence_value("seq'; DROP TABLE t; --"))
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[test]
    fn null_decodes_only_into_option() {
        let row = DbRow::new(vec![DbValue::Null, DbValue::Integer(1 << 40)]);
        assert!(matches!(row.get::<i64>(0), Err(BackendError::TypeConversion(_))));
        assert_eq!(row.get::<Option<i64>>(0).unwrap(), None);
        assert!(matches!(row.get::<i32>(1), Err(BackendError::TypeConversion(_))));
        assert!(matches!(row.get::<i64>(2), Err(BackendError::TypeConversion(_))));
    }

    #[test]
    fn readonly_connection_refuses_writes() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("ro.duckdb");
        {
            let writer = DbConnection::open(&path).unwrap();
            writer.execute_batch("CREATE TABLE t (id BIGINT)").unwrap();
        }

        let reader = DbConnection::open_readonly(&path).unwrap();
        assert!(!reader.is_writable());
        let err = reader.execute("INSERT INTO t VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, BackendError::ReadOnly));
        let n: i64 = reader.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(n, 0);
    }
}
