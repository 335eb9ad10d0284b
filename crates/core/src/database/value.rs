use super::DbError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Driver-neutral column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Text content, also for text the SQLite driver hands back as a blob.
    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

fn mismatch(expected: &str, value: &SqlValue) -> String {
    format!("expected {}, found {}", expected, value.kind())
}

/// Converts a field into the representation handed to the driver.
pub trait ToSqlValue {
    fn to_sql_value(&self) -> Result<SqlValue, DbError>;
}

/// Parses a driver value back into a typed field.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String>;
}

/// Composite column stored as a JSON document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize> ToSqlValue for Json<T> {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        serde_json::to_value(&self.0)
            .map(SqlValue::Json)
            .map_err(|e| DbError::Decode {
                column: "<param>".to_string(),
                message: e.to_string(),
            })
    }
}

impl<T: DeserializeOwned> FromSqlValue for Json<T> {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        let parsed = match value {
            SqlValue::Json(v) => serde_json::from_value(v.clone()),
            other => match other.as_text() {
                Some(text) => serde_json::from_str(text),
                None => return Err(mismatch("json", other)),
            },
        };
        parsed.map(Json).map_err(|e| e.to_string())
    }
}

impl<T: ToSqlValue + ?Sized> ToSqlValue for &T {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        (**self).to_sql_value()
    }
}

impl<T: ToSqlValue> ToSqlValue for Option<T> {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        match self {
            Some(v) => v.to_sql_value(),
            None => Ok(SqlValue::Null),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other).map(Some),
        }
    }
}

impl ToSqlValue for SqlValue {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(self.clone())
    }
}

impl FromSqlValue for SqlValue {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        Ok(value.clone())
    }
}

impl ToSqlValue for str {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Text(self.to_string()))
    }
}

impl ToSqlValue for String {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Text(self.clone()))
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Uuid(u) => Ok(u.to_string()),
            SqlValue::Json(serde_json::Value::String(s)) => Ok(s.clone()),
            other => other
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| mismatch("text", other)),
        }
    }
}

impl ToSqlValue for bool {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Bool(*self))
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(i) => Ok(*i != 0),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl ToSqlValue for i64 {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Int(*self))
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Int(i) => Ok(*i),
            other => Err(mismatch("int", other)),
        }
    }
}

impl ToSqlValue for i32 {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Int(i64::from(*self)))
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        let wide = i64::from_sql_value(value)?;
        i32::try_from(wide).map_err(|e| e.to_string())
    }
}

impl ToSqlValue for f64 {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Float(*self))
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Float(f) => Ok(*f),
            SqlValue::Int(i) => Ok(*i as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl ToSqlValue for Vec<u8> {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Bytes(self.clone()))
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Bytes(b) => Ok(b.clone()),
            SqlValue::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl ToSqlValue for Uuid {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Uuid(*self))
    }
}

impl FromSqlValue for Uuid {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Uuid(u) => Ok(*u),
            SqlValue::Bytes(b) if b.len() == 16 => Uuid::from_slice(b).map_err(|e| e.to_string()),
            other => match other.as_text() {
                Some(text) => Uuid::parse_str(text).map_err(|e| e.to_string()),
                None => Err(mismatch("uuid", other)),
            },
        }
    }
}

impl ToSqlValue for DateTime<Utc> {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Timestamp(*self))
    }
}

impl FromSqlValue for DateTime<Utc> {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        match value {
            SqlValue::Timestamp(t) => Ok(*t),
            other => match other.as_text() {
                Some(text) => parse_timestamp(text),
                None => Err(mismatch("timestamp", other)),
            },
        }
    }
}

/// Accepts RFC 3339 as well as SQLite's `CURRENT_TIMESTAMP` format.
fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {:?}: {}", text, e))
}

impl ToSqlValue for serde_json::Value {
    fn to_sql_value(&self) -> Result<SqlValue, DbError> {
        Ok(SqlValue::Json(self.clone()))
    }
}

impl FromSqlValue for serde_json::Value {
    fn from_sql_value(value: &SqlValue) -> Result<Self, String> {
        Json::<serde_json::Value>::from_sql_value(value).map(Json::into_inner)
    }
}

/// One result row with named columns
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Decode a named column.
    pub fn get<T: FromSqlValue>(&self, column: &str) -> Result<T, DbError> {
        let value = self.value(column).ok_or_else(|| DbError::Decode {
            column: column.to_string(),
            message: "no such column".to_string(),
        })?;
        T::from_sql_value(value).map_err(|message| DbError::Decode {
            column: column.to_string(),
            message,
        })
    }
}

/// Binds a result row to a typed record by column name.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DbError>;
}

/// Builds a `Vec<SqlValue>` from fields implementing `ToSqlValue`.
/// Expands to `?`, so it must be used inside a function returning a
/// `Result` whose error converts from `DbError`.
#[macro_export]
macro_rules! sql_args {
    () => {
        ::std::vec::Vec::<$crate::database::SqlValue>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::database::ToSqlValue::to_sql_value(&$arg)?),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::types::{ErrorDetails, ExecutionState, FailureType};

    fn row(values: Vec<SqlValue>) -> Row {
        let columns: Vec<String> = (0..values.len()).map(|i| format!("c{}", i)).collect();
        Row::new(columns.into(), values)
    }

    #[test]
    fn test_json_column_accepts_text_and_blob() {
        let state = ExecutionState::failed(
            FailureType::System,
            ErrorDetails::internal("boom"),
            Utc::now(),
        );
        let text = serde_json::to_string(&state).unwrap();
        let r = row(vec![
            SqlValue::Text(text.clone()),
            SqlValue::Bytes(text.into_bytes()),
            Json(&state).to_sql_value().unwrap(),
        ]);

        for column in ["c0", "c1", "c2"] {
            let Json(parsed): Json<ExecutionState> = r.get(column).unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_nullable_composite() {
        let none: Option<Json<StorageConfig>> = None;
        assert_eq!(none.to_sql_value().unwrap(), SqlValue::Null);

        let r = row(vec![SqlValue::Null]);
        let parsed: Option<Json<StorageConfig>> = r.get("c0").unwrap();
        assert!(parsed.is_none());
        assert!(r.get::<Json<StorageConfig>>("c0").is_err());
    }

    #[test]
    fn test_uuid_and_timestamp_from_text() {
        let id = Uuid::new_v4();
        let r = row(vec![
            SqlValue::Text(id.to_string()),
            SqlValue::Text("2023-01-02 03:04:05".to_string()),
            SqlValue::Int(1),
        ]);
        assert_eq!(r.get::<Uuid>("c0").unwrap(), id);
        let t: DateTime<Utc> = r.get("c1").unwrap();
        assert_eq!(t.to_rfc3339(), "2023-01-02T03:04:05+00:00");
        assert!(r.get::<bool>("c2").unwrap());
        assert!(matches!(r.get::<i64>("missing"), Err(DbError::Decode { .. })));
    }

    #[test]
    fn test_sql_args_macro() -> Result<(), DbError> {
        let id = Uuid::new_v4();
        let name = "wf";
        let args = sql_args![id, name, 3i64, Option::<String>::None];
        assert_eq!(
            args,
            vec![
                SqlValue::Uuid(id),
                SqlValue::Text("wf".to_string()),
                SqlValue::Int(3),
                SqlValue::Null,
            ]
        );
        assert!(sql_args![].is_empty());
        Ok(())
    }
}
