use super::{Database, DbError, Dialect, Row, Session, SqlValue, Transaction};
use chrono::SecondsFormat;
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded SQLite catalog.
///
/// Ids are stored as hyphenated text in `BLOB` columns and JSON as text.
/// Each transaction gets its own connection and takes the write lock up
/// front (`BEGIN IMMEDIATE`), so concurrent writers wait instead of failing
/// on lock upgrade.
pub struct SqliteDatabase {
    path: PathBuf,
    autocommit: SqliteSession,
}

impl SqliteDatabase {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = connect(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            autocommit: SqliteSession {
                conn: Mutex::new(conn),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn connect(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path).map_err(map_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_error)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(map_error)?;
    Ok(conn)
}

impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        self.autocommit.execute(sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.autocommit.query(sql, args)
    }

    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.autocommit.execute_batch(sql)
    }

    fn begin_transaction(&self) -> Result<Transaction<'_>, DbError> {
        let session = SqliteSession {
            conn: Mutex::new(connect(&self.path)?),
        };
        session.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Transaction::begun(Box::new(session)))
    }
}

struct SqliteSession {
    conn: Mutex<Connection>,
}

impl Session for SqliteSession {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        let sql = rewrite_placeholders(sql);
        let params: Vec<Value> = args.iter().map(to_sqlite).collect();
        let conn = self.conn.lock();
        let changed = conn
            .execute(&sql, rusqlite::params_from_iter(params.iter()))
            .map_err(map_error)?;
        Ok(changed as u64)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let sql = rewrite_placeholders(sql);
        let params: Vec<Value> = args.iter().map(to_sqlite).collect();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(map_error)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(map_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let raw = row.get_ref(i).map_err(map_error)?;
                values.push(from_sqlite(column, raw)?);
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.conn.lock().execute_batch(sql).map_err(map_error)
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Uuid(u) => Value::Text(u.to_string()),
        SqlValue::Json(v) => Value::Text(v.to_string()),
        // Fixed-width so text ordering matches time ordering.
        SqlValue::Timestamp(t) => Value::Text(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
    }
}

fn from_sqlite(column: &str, raw: ValueRef<'_>) -> Result<SqlValue, DbError> {
    Ok(match raw {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(
            String::from_utf8(bytes.to_vec()).map_err(|e| DbError::Decode {
                column: column.to_string(),
                message: e.to_string(),
            })?,
        ),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    })
}

fn map_error(err: rusqlite::Error) -> DbError {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(err.to_string()),
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                ) =>
        {
            DbError::UniqueViolation(err.to_string())
        }
        _ => DbError::Io(err.to_string()),
    }
}

/// Rewrites `$N` placeholders to SQLite's `?N`, leaving quoted text alone.
fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '$' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => out.push('?'),
                _ => out.push(c),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Json, QueryExt, ToSqlValue};
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_rewrite_placeholders() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a = $1 AND b = $12"),
            "SELECT * FROM t WHERE a = ?1 AND b = ?12"
        );
        assert_eq!(
            rewrite_placeholders("SELECT '$1' AS lit, $2"),
            "SELECT '$1' AS lit, ?2"
        );
    }

    #[test]
    fn test_typed_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(&dir.path().join("c.db")).unwrap();
        db.execute_batch("CREATE TABLE t (id BLOB PRIMARY KEY, doc BLOB, at TEXT, flag BOOLEAN)")
            .unwrap();

        let id = Uuid::new_v4();
        let now = Utc::now();
        let doc = serde_json::json!({"a": [1, 2]});
        db.execute(
            "INSERT INTO t (id, doc, at, flag) VALUES ($1, $2, $3, $4)",
            &[
                id.to_sql_value().unwrap(),
                Json(&doc).to_sql_value().unwrap(),
                now.to_sql_value().unwrap(),
                true.to_sql_value().unwrap(),
            ],
        )
        .unwrap();

        let rows = db
            .query("SELECT id, doc, at, flag FROM t WHERE id = $1", &[SqlValue::Uuid(id)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<Uuid>("id").unwrap(), id);
        assert_eq!(rows[0].get::<Json<serde_json::Value>>("doc").unwrap().0, doc);
        let at: DateTime<Utc> = rows[0].get("at").unwrap();
        assert_eq!(at.timestamp_micros(), now.timestamp_micros());
        assert!(rows[0].get::<bool>("flag").unwrap());

        let n: i64 = db.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_transactions_use_separate_connections() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(&dir.path().join("c.db")).unwrap();
        db.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let txn = db.begin_transaction().unwrap();
        txn.execute("INSERT INTO t (v) VALUES ($1)", &[SqlValue::Int(1)])
            .unwrap();
        // Uncommitted writes are invisible to the autocommit connection.
        let n: i64 = db.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(n, 0);
        txn.commit().unwrap();
        let n: i64 = db.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(n, 1);
    }
}
