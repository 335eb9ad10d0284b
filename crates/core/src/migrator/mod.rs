//! Versioned schema migrations for the catalog.
//!
//! The `schema_version` table holds exactly one row: the current head
//! version, whether it is dirty, and the step's name. A step marks the head
//! dirty before it runs and clears the flag once its transaction commits,
//! so a crash or failure mid-step leaves `dirty = true` behind. A dirty
//! catalog refuses every command except [`Migrator::version`] until an
//! operator verifies the half-applied step and clears the flag by hand.

mod registry;
mod scaffold;
mod steps;

pub use registry::{Action, Registry, Step, StepContext, StepFn};
pub use scaffold::{create, ScaffoldKind};

use crate::database::{Database, DbError, Dialect, QueryExt};
use crate::sql_args;
use std::sync::Arc;
use tracing::{info, warn};

/// Interpreter used by steps that shell out to the Python serializers.
pub const DEFAULT_PYTHON: &str = "python3";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(
        "Schema version {version} ({name}) is dirty: verify the half-applied step, \
         then clear the flag in schema_version by hand"
    )]
    Dirty { version: i64, name: String },

    #[error("Migration {version} has no down step for {dialect}")]
    NoDownStep { version: i64, dialect: Dialect },

    #[error("Refusing to migrate below the base schema version {0}")]
    BelowBase(i64),

    #[error("Unknown schema version: {0}")]
    UnknownVersion(i64),

    #[error("Migration {version} ({name}) failed: {source}")]
    Step {
        version: i64,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Failed to scaffold migration: {0}")]
    Scaffold(String),
}

/// The head row of `schema_version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersion {
    pub version: i64,
    pub dirty: bool,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

pub struct Migrator {
    db: Arc<dyn Database>,
    registry: Registry,
    python: String,
}

impl Migrator {
    pub fn new(db: Arc<dyn Database>, registry: Registry) -> Self {
        Self {
            db,
            registry,
            python: DEFAULT_PYTHON.to_string(),
        }
    }

    /// Interpreter handed to steps that need the Python helper.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current head. Never refused, even when dirty.
    pub fn version(&self) -> Result<SchemaVersion, MigrationError> {
        let head = self.head()?;
        if head.dirty {
            warn!(
                "Schema version {} ({}) is dirty; a previous migration did not finish",
                head.version, head.name
            );
        }
        Ok(head)
    }

    /// Apply every registered step above the current head.
    pub fn up(&self) -> Result<SchemaVersion, MigrationError> {
        loop {
            let head = self.clean_head()?;
            match self.registry.next_after(head.version) {
                Some(step) => self.apply(step, Direction::Up)?,
                None => return Ok(head),
            }
        }
    }

    /// Undo the current head step.
    pub fn down(&self) -> Result<SchemaVersion, MigrationError> {
        let head = self.clean_head()?;
        let step = self.down_step(head.version)?;
        self.apply(step, Direction::Down)?;
        self.head()
    }

    /// Step up or down until the head is `target`.
    pub fn goto(&self, target: i64) -> Result<SchemaVersion, MigrationError> {
        if target != 0 && self.registry.get(target).is_none() {
            return Err(MigrationError::UnknownVersion(target));
        }
        loop {
            let head = self.clean_head()?;
            if head.version < target {
                let step = self
                    .registry
                    .next_after(head.version)
                    .ok_or(MigrationError::UnknownVersion(target))?;
                self.apply(step, Direction::Up)?;
            } else if head.version > target {
                let step = self.down_step(head.version)?;
                self.apply(step, Direction::Down)?;
            } else {
                return Ok(head);
            }
        }
    }

    fn down_step(&self, version: i64) -> Result<&Step, MigrationError> {
        let base = self.registry.base_version().unwrap_or(0);
        if version <= base {
            return Err(MigrationError::BelowBase(base));
        }
        self.registry
            .get(version)
            .ok_or(MigrationError::UnknownVersion(version))
    }

    fn apply(&self, step: &Step, direction: Direction) -> Result<(), MigrationError> {
        let dialect = self.db.dialect();
        let action = match direction {
            Direction::Up => step.up_for(dialect).ok_or_else(|| {
                MigrationError::Database(DbError::DialectUnsupported {
                    dialect,
                    operation: format!("migration {} ({})", step.version, step.name),
                })
            })?,
            Direction::Down => step.down_for(dialect).ok_or(MigrationError::NoDownStep {
                version: step.version,
                dialect,
            })?,
        };

        info!(
            "Running migration {} ({}) {:?} on {}",
            step.version, step.name, direction, dialect
        );
        self.set_head(step.version, true, &step.name)?;

        let txn = self.db.begin_transaction()?;
        let ctx = StepContext {
            db: &txn,
            dialect,
            python: &self.python,
        };
        action.run(&ctx).map_err(|source| MigrationError::Step {
            version: step.version,
            name: step.name.clone(),
            source: source.into(),
        })?;
        txn.commit()?;

        match direction {
            Direction::Up => self.set_head(step.version, false, &step.name)?,
            Direction::Down => {
                let (version, name) = match self.registry.previous(step.version) {
                    Some(prev) => (prev.version, prev.name.clone()),
                    None => (0, String::new()),
                };
                self.set_head(version, false, &name)?;
            }
        }
        info!("Migration {} ({}) complete", step.version, step.name);
        Ok(())
    }

    fn clean_head(&self) -> Result<SchemaVersion, MigrationError> {
        let head = self.head()?;
        if head.dirty {
            return Err(MigrationError::Dirty {
                version: head.version,
                name: head.name,
            });
        }
        Ok(head)
    }

    fn head(&self) -> Result<SchemaVersion, MigrationError> {
        self.ensure_version_table()?;
        let rows = self
            .db
            .query("SELECT version, dirty, name FROM schema_version", &[])?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::NotFound("schema_version row".to_string()))?;
        Ok(SchemaVersion {
            version: row.get("version")?,
            dirty: row.get("dirty")?,
            name: row.get("name")?,
        })
    }

    fn set_head(&self, version: i64, dirty: bool, name: &str) -> Result<(), MigrationError> {
        self.db.execute(
            "UPDATE schema_version SET version = $1, dirty = $2, name = $3",
            &sql_args![version, dirty, name],
        )?;
        Ok(())
    }

    fn ensure_version_table(&self) -> Result<(), DbError> {
        let txn = self.db.begin_transaction()?;
        txn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (\
                 version BIGINT NOT NULL, \
                 dirty BOOLEAN NOT NULL, \
                 name VARCHAR NOT NULL DEFAULT ''\
             )",
        )?;
        let rows: i64 = txn.query_scalar("SELECT COUNT(*) AS n FROM schema_version", &[])?;
        if rows == 0 {
            txn.execute(
                "INSERT INTO schema_version (version, dirty, name) VALUES ($1, $2, $3)",
                &sql_args![0i64, false, ""],
            )?;
        }
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;
    use tempfile::TempDir;

    fn sqlite(dir: &TempDir) -> Arc<dyn Database> {
        Arc::new(SqliteDatabase::open(&dir.path().join("catalog.db")).unwrap())
    }

    fn fail_midway(ctx: &StepContext<'_>) -> anyhow::Result<()> {
        ctx.db
            .execute_batch("ALTER TABLE workflow ADD COLUMN half_applied BLOB")?;
        anyhow::bail!("simulated failure after partial DDL")
    }

    fn registry_through(version: i64) -> Registry {
        let mut registry = Registry::builtin();
        registry.truncate(version);
        registry
    }

    #[test]
    fn test_fresh_catalog_reports_version_zero() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(sqlite(&dir), Registry::builtin());
        assert_eq!(
            migrator.version().unwrap(),
            SchemaVersion {
                version: 0,
                dirty: false,
                name: String::new()
            }
        );
    }

    #[test]
    fn test_up_applies_every_step() {
        let dir = TempDir::new().unwrap();
        let db = sqlite(&dir);
        let migrator = Migrator::new(db.clone(), Registry::builtin());
        let head = migrator.up().unwrap();
        let latest = Registry::builtin().latest_version().unwrap();
        assert_eq!(head.version, latest);
        assert!(!head.dirty);

        // Running it again is a no-op.
        assert_eq!(migrator.up().unwrap().version, latest);
        let rows: i64 = db
            .query_scalar("SELECT COUNT(*) AS n FROM schema_version", &[])
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_failed_step_leaves_dirty_head() {
        let dir = TempDir::new().unwrap();
        let db = sqlite(&dir);
        Migrator::new(db.clone(), registry_through(5)).up().unwrap();

        let mut registry = registry_through(5);
        registry.register(Step::new(6, "fail_midway").up(Action::Code(fail_midway)));
        let migrator = Migrator::new(db.clone(), registry);

        let err = migrator.up().unwrap_err();
        assert!(matches!(err, MigrationError::Step { version: 6, .. }), "got {:?}", err);

        let head = migrator.version().unwrap();
        assert_eq!(
            head,
            SchemaVersion {
                version: 6,
                dirty: true,
                name: "fail_midway".to_string()
            }
        );
        assert!(matches!(migrator.up(), Err(MigrationError::Dirty { version: 6, .. })));
        assert!(matches!(migrator.goto(6), Err(MigrationError::Dirty { .. })));

        // The step's own transaction rolled back.
        assert!(db.query("SELECT half_applied FROM workflow", &[]).is_err());
    }

    #[test]
    fn test_goto_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(sqlite(&dir), Registry::builtin());
        let first = migrator.goto(4).unwrap();
        let second = migrator.goto(4).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.version, 4);
        assert!(!second.dirty);
        assert_eq!(second.name, "execution_state");
    }

    #[test]
    fn test_goto_unknown_version() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(sqlite(&dir), Registry::builtin());
        assert!(matches!(migrator.goto(999), Err(MigrationError::UnknownVersion(999))));
    }

    #[test]
    fn test_sqlite_has_no_down_steps() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(sqlite(&dir), Registry::builtin());
        migrator.goto(2).unwrap();
        assert!(matches!(
            migrator.down(),
            Err(MigrationError::NoDownStep {
                version: 2,
                dialect: Dialect::Sqlite
            })
        ));
        // Refused before the head is touched.
        assert!(!migrator.version().unwrap().dirty);
    }

    #[test]
    fn test_base_step_cannot_be_undone() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(sqlite(&dir), Registry::builtin());
        migrator.goto(1).unwrap();
        assert!(matches!(migrator.down(), Err(MigrationError::BelowBase(1))));
        assert!(matches!(migrator.goto(0), Err(MigrationError::BelowBase(1))));
    }
}
