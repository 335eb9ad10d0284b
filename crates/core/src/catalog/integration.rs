use crate::database::{Database, DbError, FromRow, Json, QueryExt, Row};
use crate::models::Integration;
use crate::sql_args;
use std::collections::HashMap;
use uuid::Uuid;

const COLUMNS: &str = "id, user_id, organization_id, service, name, config, created_at, validated";

impl FromRow for Integration {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            organization_id: row.get("organization_id")?,
            service: row.get("service")?,
            name: row.get("name")?,
            config: row.get::<Json<HashMap<String, String>>>("config")?.0,
            created_at: row.get("created_at")?,
            validated: row.get("validated")?,
        })
    }
}

/// Connector resources. Their credentials live in the vault, keyed by id.
pub struct IntegrationRepository;

impl IntegrationRepository {
    pub fn create(db: &dyn Database, integration: &Integration) -> Result<(), DbError> {
        db.execute(
            &format!(
                "INSERT INTO integration ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ),
            &sql_args![
                integration.id,
                integration.user_id,
                integration.organization_id,
                integration.service,
                integration.name,
                Json(&integration.config),
                integration.created_at,
                integration.validated
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<Integration, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM integration WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("integration", id))
    }

    pub fn list_by_organization(
        db: &dyn Database,
        organization_id: &str,
    ) -> Result<Vec<Integration>, DbError> {
        db.query_as(
            &format!(
                "SELECT {COLUMNS} FROM integration WHERE organization_id = $1 ORDER BY created_at"
            ),
            &sql_args![organization_id],
        )
    }

    pub fn list(db: &dyn Database) -> Result<Vec<Integration>, DbError> {
        db.query_as(
            &format!("SELECT {COLUMNS} FROM integration ORDER BY created_at"),
            &[],
        )
    }

    pub fn delete(db: &dyn Database, id: Uuid) -> Result<(), DbError> {
        let changed = db.execute("DELETE FROM integration WHERE id = $1", &sql_args![id])?;
        if changed == 0 {
            return Err(DbError::not_found("integration", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::catalog;
    use chrono::Utc;

    #[test]
    fn test_integration_round_trip() {
        let (_dir, db) = catalog();
        let db = db.as_ref();
        let integration = Integration {
            id: Uuid::new_v4(),
            user_id: None,
            organization_id: "org".to_string(),
            service: "postgres".to_string(),
            name: "warehouse".to_string(),
            config: HashMap::from([("host".to_string(), "db.internal".to_string())]),
            created_at: Utc::now(),
            validated: true,
        };
        IntegrationRepository::create(db, &integration).unwrap();

        let stored = IntegrationRepository::get(db, integration.id).unwrap();
        assert_eq!(stored.config, integration.config);
        assert!(stored.validated);
        assert!(stored.user_id.is_none());
        assert_eq!(IntegrationRepository::list_by_organization(db, "org").unwrap().len(), 1);

        IntegrationRepository::delete(db, integration.id).unwrap();
        assert!(IntegrationRepository::list(db).unwrap().is_empty());
    }
}
