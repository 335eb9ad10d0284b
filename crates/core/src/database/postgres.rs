use super::{Database, DbError, Dialect, Row, Session, SqlValue, Transaction};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use postgres::error::SqlState;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, NoTls};
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Idle connections kept around for reuse.
const MAX_IDLE: usize = 4;

/// PostgreSQL catalog over the synchronous `postgres` client.
///
/// Calls block the current thread; inside a multi-threaded tokio runtime
/// they are wrapped in `block_in_place`, inside a current-thread one they
/// run on a scoped thread.
pub struct PostgresDatabase {
    url: String,
    idle: Mutex<Vec<Client>>,
}

impl PostgresDatabase {
    pub fn connect(url: &str) -> Result<Self, DbError> {
        let client = blocking(|| Client::connect(url, NoTls)).map_err(map_error)?;
        Ok(Self {
            url: url.to_string(),
            idle: Mutex::new(vec![client]),
        })
    }

    fn checkout(&self) -> Result<PgSession<'_>, DbError> {
        let pooled = {
            let mut idle = self.idle.lock();
            idle.retain(|c| !c.is_closed());
            idle.pop()
        };
        let client = match pooled {
            Some(client) => client,
            None => blocking(|| Client::connect(&self.url, NoTls)).map_err(map_error)?,
        };
        Ok(PgSession {
            pool: self,
            client: Mutex::new(Some(client)),
        })
    }

    fn checkin(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(client);
        }
    }
}

impl Database for PostgresDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        self.checkout()?.execute(sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.checkout()?.query(sql, args)
    }

    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.checkout()?.execute_batch(sql)
    }

    fn begin_transaction(&self) -> Result<Transaction<'_>, DbError> {
        let session = self.checkout()?;
        session.execute_batch("BEGIN")?;
        Ok(Transaction::begun(Box::new(session)))
    }
}

/// A checked-out client, returned to the pool on drop.
struct PgSession<'a> {
    pool: &'a PostgresDatabase,
    client: Mutex<Option<Client>>,
}

impl PgSession<'_> {
    fn with_client<T>(
        &self,
        f: impl FnOnce(&mut Client) -> Result<T, postgres::Error> + Send,
    ) -> Result<T, DbError>
    where
        T: Send,
    {
        let mut guard = self.client.lock();
        let client = guard
            .as_mut()
            .ok_or_else(|| DbError::Io("connection already released".to_string()))?;
        blocking(|| f(client)).map_err(map_error)
    }
}

impl Drop for PgSession<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.get_mut().take() {
            self.pool.checkin(client);
        }
    }
}

fn params(args: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

impl Session for PgSession<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        self.with_client(|client| client.execute(sql, &params(args)))
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let rows = self.with_client(|client| client.query(sql, &params(args)))?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();

        rows.iter()
            .map(|row| {
                let values = (0..columns.len())
                    .map(|i| from_pg(row, i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Row::new(columns.clone(), values))
            })
            .collect()
    }

    fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.with_client(|client| client.batch_execute(sql))
    }
}

/// Run a call that drives the client's own runtime. Inside a
/// current-thread runtime it moves to a scoped thread, since the client
/// cannot block on a thread that already runs one.
fn blocking<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        Ok(_) => std::thread::scope(|scope| match scope.spawn(f).join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }),
        Err(_) => f(),
    }
}

fn map_error(err: postgres::Error) -> DbError {
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        DbError::UniqueViolation(message)
    } else {
        DbError::Io(message)
    }
}

fn is_text(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            SqlValue::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            SqlValue::Text(s) => {
                if *ty == Type::UUID {
                    uuid::Uuid::parse_str(s)?.to_sql(ty, out)
                } else if *ty == Type::JSON || *ty == Type::JSONB {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                } else {
                    s.to_sql(ty, out)
                }
            }
            SqlValue::Bytes(b) => b.to_sql(ty, out),
            SqlValue::Uuid(u) => {
                if is_text(ty) {
                    u.to_string().to_sql(ty, out)
                } else {
                    u.to_sql(ty, out)
                }
            }
            SqlValue::Json(v) => {
                if is_text(ty) {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Timestamp(t) => {
                if *ty == Type::TIMESTAMP {
                    t.naive_utc().to_sql(ty, out)
                } else {
                    t.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn from_pg(row: &postgres::Row, i: usize) -> Result<SqlValue, DbError> {
    let column = &row.columns()[i];
    let ty = column.type_();
    let decode = |e: postgres::Error| DbError::Decode {
        column: column.name().to_string(),
        message: e.to_string(),
    };

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i).map_err(decode)?.map(SqlValue::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i)
            .map_err(decode)?
            .map(|v| SqlValue::Int(i64::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i)
            .map_err(decode)?
            .map(|v| SqlValue::Int(i64::from(v)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i).map_err(decode)?.map(SqlValue::Int)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(i)
            .map_err(decode)?
            .map(|v| SqlValue::Float(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(i).map_err(decode)?.map(SqlValue::Float)
    } else if is_text(ty) {
        row.try_get::<_, Option<String>>(i).map_err(decode)?.map(SqlValue::Text)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(i).map_err(decode)?.map(SqlValue::Bytes)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(i).map_err(decode)?.map(SqlValue::Uuid)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(i)
            .map_err(decode)?
            .map(SqlValue::Json)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(i)
            .map_err(decode)?
            .map(SqlValue::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(i)
            .map_err(decode)?
            .map(|t| SqlValue::Timestamp(t.and_utc()))
    } else {
        return Err(DbError::Decode {
            column: column.name().to_string(),
            message: format!("unsupported column type {}", ty),
        });
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::blocking;
    use tokio::runtime::Handle;

    #[test]
    fn test_blocking_outside_runtime_runs_inline() {
        let caller = std::thread::current().id();
        assert_eq!(blocking(|| std::thread::current().id()), caller);
    }

    #[tokio::test]
    async fn test_blocking_leaves_current_thread_runtime() {
        // The client panics if it blocks where a runtime is entered.
        assert!(blocking(|| Handle::try_current().is_err()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_in_place_on_multi_thread_runtime() {
        let caller = std::thread::current().id();
        assert_eq!(blocking(|| std::thread::current().id()), caller);
    }
}
