//! Typed persistence for catalog entities.
//!
//! Every repository takes a `&dyn Database`, which may be a plain
//! connection or an open [`Transaction`](crate::database::Transaction).
//! Multi-statement writes open a nested transaction of their own, so they
//! stay atomic on their own and compose inside a caller's transaction.

mod artifact;
mod dag;
mod edge;
mod integration;
mod operator;
mod result;
mod user;
mod workflow;

pub use artifact::ArtifactRepository;
pub use dag::DagRepository;
pub use edge::EdgeRepository;
pub use integration::IntegrationRepository;
pub use operator::OperatorRepository;
pub use result::{ArtifactResultRepository, DagResultRepository, OperatorResultRepository};
pub use user::UserRepository;
pub use workflow::WorkflowRepository;

use crate::database::{Dialect, SqlValue};
use uuid::Uuid;

/// Expression extracting a top-level JSON field as text.
pub(crate) fn json_field(dialect: Dialect, column: &str, field: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("{}->>'{}'", column, field),
        Dialect::Sqlite => format!("json_extract({}, '$.{}')", column, field),
    }
}

/// `$start, $start+1, ...` placeholders plus their bound ids for an `IN (...)` list.
pub(crate) fn id_list(ids: &[Uuid], start: usize) -> (String, Vec<SqlValue>) {
    let placeholders = (0..ids.len())
        .map(|i| format!("${}", start + i))
        .collect::<Vec<_>>()
        .join(", ");
    let args = ids.iter().map(|id| SqlValue::Uuid(*id)).collect();
    (placeholders, args)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_list() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (sql, args) = id_list(&[a, b], 3);
        assert_eq!(sql, "$3, $4");
        assert_eq!(args, vec![SqlValue::Uuid(a), SqlValue::Uuid(b)]);
    }

    #[test]
    fn test_json_field() {
        assert_eq!(json_field(Dialect::Postgres, "schedule", "trigger"), "schedule->>'trigger'");
        assert_eq!(
            json_field(Dialect::Sqlite, "schedule", "trigger"),
            "json_extract(schedule, '$.trigger')"
        );
    }
}
