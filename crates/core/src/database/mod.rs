//! SQL dialect abstraction over PostgreSQL and embedded SQLite.
//!
//! Statements are written once with `$N` placeholders. Composite columns go
//! through [`Json`]; nullable columns are `Option<T>`.

mod postgres;
mod sqlite;
mod value;

pub use self::postgres::PostgresDatabase;
pub use self::sqlite::SqliteDatabase;
pub use value::{FromRow, FromSqlValue, Json, Row, SqlValue, ToSqlValue};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(format!("unknown database dialect: {}", other)),
        }
    }
}

/// Repository-level failures
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Not supported on {dialect}: {operation}")]
    DialectUnsupported { dialect: Dialect, operation: String },

    #[error("Database I/O error: {0}")]
    Io(String),

    #[error("Failed to decode column {column}: {message}")]
    Decode { column: String, message: String },
}

impl DbError {
    pub fn not_found(what: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", what, id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A catalog connection. Implemented by each backend and by [`Transaction`],
/// so repositories run unchanged inside or outside a transaction.
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run one statement, returning the number of affected rows.
    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError>;

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    /// Run several `;`-separated statements without parameters.
    fn execute_batch(&self, sql: &str) -> Result<(), DbError>;

    /// Start a transaction, or a savepoint when already inside one.
    fn begin_transaction(&self) -> Result<Transaction<'_>, DbError>;
}

/// Typed helpers layered over [`Database::query`].
pub trait QueryExt: Database {
    fn query_as<T: FromRow>(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<T>, DbError> {
        self.query(sql, args)?.iter().map(T::from_row).collect()
    }

    fn query_optional<T: FromRow>(
        &self,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<Option<T>, DbError> {
        match self.query(sql, args)?.first() {
            Some(row) => T::from_row(row).map(Some),
            None => Ok(None),
        }
    }

    /// First column of the first row.
    fn query_scalar<T: FromSqlValue>(&self, sql: &str, args: &[SqlValue]) -> Result<T, DbError> {
        let rows = self.query(sql, args)?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::NotFound("scalar query returned no rows".to_string()))?;
        let column = row
            .columns()
            .first()
            .cloned()
            .ok_or_else(|| DbError::NotFound("scalar query returned no columns".to_string()))?;
        row.get(&column)
    }
}

impl<D: Database + ?Sized> QueryExt for D {}

/// One open backend connection that statements of a transaction run on.
pub(crate) trait Session: Send + Sync {
    fn dialect(&self) -> Dialect;
    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError>;
    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError>;
    fn execute_batch(&self, sql: &str) -> Result<(), DbError>;
}

enum Handle<'a> {
    Owned(Box<dyn Session + 'a>),
    Borrowed(&'a dyn Session),
}

fn savepoint_name(depth: u32) -> String {
    format!("aq_sp_{}", depth)
}

/// A transaction (depth 0) or savepoint (depth > 0).
///
/// Dropping it without `commit` rolls back.
pub struct Transaction<'a> {
    handle: Handle<'a>,
    depth: u32,
    done: bool,
}

impl<'a> Transaction<'a> {
    /// Wraps a session the backend has already issued `BEGIN` on.
    pub(crate) fn begun(session: Box<dyn Session + 'a>) -> Self {
        Self {
            handle: Handle::Owned(session),
            depth: 0,
            done: false,
        }
    }

    fn session(&self) -> &dyn Session {
        match &self.handle {
            Handle::Owned(session) => session.as_ref(),
            Handle::Borrowed(session) => *session,
        }
    }

    pub fn commit(mut self) -> Result<(), DbError> {
        self.done = true;
        if self.depth == 0 {
            self.session().execute_batch("COMMIT")
        } else {
            let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(self.depth));
            self.session().execute_batch(&sql)
        }
    }

    pub fn rollback(mut self) -> Result<(), DbError> {
        self.done = true;
        self.rollback_inner()
    }

    fn rollback_inner(&self) -> Result<(), DbError> {
        if self.depth == 0 {
            self.session().execute_batch("ROLLBACK")
        } else {
            let name = savepoint_name(self.depth);
            let sql = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
            self.session().execute_batch(&sql)
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.rollback_inner() {
                tracing::warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}

impl Database for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.session().dialect()
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        self.session().execute(sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.session().query(sql, args)
    }

    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.session().execute_batch(sql)
    }

    fn begin_transaction(&self) -> Result<Transaction<'_>, DbError> {
        let depth = self.depth + 1;
        let sql = format!("SAVEPOINT {}", savepoint_name(depth));
        self.session().execute_batch(&sql)?;
        Ok(Transaction {
            handle: Handle::Borrowed(self.session()),
            depth,
            done: false,
        })
    }
}

/// Which catalog database to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Sqlite { path: PathBuf },
    Postgres { url: String },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("aqueduct.db"),
        }
    }
}

impl DatabaseConfig {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sqlite { .. } => Dialect::Sqlite,
            Self::Postgres { .. } => Dialect::Postgres,
        }
    }
}

/// Connect to the configured catalog.
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn Database>, DbError> {
    match config {
        DatabaseConfig::Sqlite { path } => Ok(Arc::new(SqliteDatabase::open(path)?)),
        DatabaseConfig::Postgres { url } => Ok(Arc::new(PostgresDatabase::connect(url)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn database(dir: &TempDir) -> SqliteDatabase {
        let db = SqliteDatabase::open(&dir.path().join("catalog.db")).unwrap();
        db.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
            .unwrap();
        db
    }

    fn count(db: &dyn Database) -> i64 {
        db.query_scalar("SELECT COUNT(*) AS n FROM t", &[]).unwrap()
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);

        {
            let txn = db.begin_transaction().unwrap();
            txn.execute("INSERT INTO t (name) VALUES ($1)", &[SqlValue::Text("a".into())])
                .unwrap();
            assert_eq!(count(&txn), 1);
        }
        assert_eq!(count(&db), 0);

        let txn = db.begin_transaction().unwrap();
        txn.execute("INSERT INTO t (name) VALUES ($1)", &[SqlValue::Text("a".into())])
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn test_nested_savepoint() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);

        let outer = db.begin_transaction().unwrap();
        outer
            .execute("INSERT INTO t (name) VALUES ($1)", &[SqlValue::Text("kept".into())])
            .unwrap();
        {
            let inner = outer.begin_transaction().unwrap();
            inner
                .execute("INSERT INTO t (name) VALUES ($1)", &[SqlValue::Text("dropped".into())])
                .unwrap();
            inner.rollback().unwrap();
        }
        let inner = outer.begin_transaction().unwrap();
        inner
            .execute("INSERT INTO t (name) VALUES ($1)", &[SqlValue::Text("nested".into())])
            .unwrap();
        inner.commit().unwrap();
        outer.commit().unwrap();

        let names: Vec<String> = db
            .query("SELECT name FROM t ORDER BY id", &[])
            .unwrap()
            .iter()
            .map(|r| r.get("name").unwrap())
            .collect();
        assert_eq!(names, vec!["kept", "nested"]);
    }

    #[test]
    fn test_unique_violation_is_typed() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let args = [SqlValue::Text("dup".into())];
        db.execute("INSERT INTO t (name) VALUES ($1)", &args).unwrap();
        let err = db.execute("INSERT INTO t (name) VALUES ($1)", &args).unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation(_)), "got {:?}", err);
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("sqlite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert!("mysql".parse::<Dialect>().is_err());
    }
}
