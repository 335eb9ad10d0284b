use crate::database::{Database, DbError, FromRow, QueryExt, Row};
use crate::models::User;
use crate::sql_args;
use uuid::Uuid;

const COLUMNS: &str = "id, email, organization_id, api_key, auth0_id";

impl FromRow for User {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            organization_id: row.get("organization_id")?,
            api_key: row.get("api_key")?,
            auth0_id: row.get("auth0_id")?,
        })
    }
}

pub struct UserRepository;

impl UserRepository {
    /// Create a user with a freshly generated API key.
    pub fn create(
        db: &dyn Database,
        email: &str,
        organization_id: &str,
        auth0_id: &str,
    ) -> Result<User, DbError> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            organization_id: organization_id.to_string(),
            api_key: Uuid::new_v4().simple().to_string(),
            auth0_id: auth0_id.to_string(),
        };
        db.execute(
            &format!("INSERT INTO app_user ({COLUMNS}) VALUES ($1, $2, $3, $4, $5)"),
            &sql_args![
                user.id,
                user.email,
                user.organization_id,
                user.api_key,
                user.auth0_id
            ],
        )?;
        Ok(user)
    }

    pub fn get(db: &dyn Database, id: Uuid) -> Result<User, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM app_user WHERE id = $1"),
            &sql_args![id],
        )?
        .ok_or_else(|| DbError::not_found("user", id))
    }

    pub fn get_by_api_key(db: &dyn Database, api_key: &str) -> Result<User, DbError> {
        db.query_optional(
            &format!("SELECT {COLUMNS} FROM app_user WHERE api_key = $1"),
            &sql_args![api_key],
        )?
        .ok_or_else(|| DbError::NotFound("user with the given api key".to_string()))
    }

    pub fn list_by_organization(
        db: &dyn Database,
        organization_id: &str,
    ) -> Result<Vec<User>, DbError> {
        db.query_as(
            &format!("SELECT {COLUMNS} FROM app_user WHERE organization_id = $1 ORDER BY email"),
            &sql_args![organization_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::catalog;

    #[test]
    fn test_create_and_lookup() {
        let (_dir, db) = catalog();
        let user = UserRepository::create(db.as_ref(), "a@b.c", "org", "auth|1").unwrap();

        assert_eq!(UserRepository::get(db.as_ref(), user.id).unwrap(), user);
        assert_eq!(
            UserRepository::get_by_api_key(db.as_ref(), &user.api_key).unwrap().id,
            user.id
        );
        assert_eq!(
            UserRepository::list_by_organization(db.as_ref(), "org").unwrap(),
            vec![user]
        );
        assert!(UserRepository::get(db.as_ref(), Uuid::new_v4())
            .unwrap_err()
            .is_not_found());
    }
}
