use super::{steps, MigrationError};
use crate::database::{Database, Dialect};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// What a step body sees: the step's own transaction and its dialect.
pub struct StepContext<'a> {
    pub db: &'a dyn Database,
    pub dialect: Dialect,
    /// Python interpreter for steps that delegate to the SDK serializers.
    pub python: &'a str,
}

pub type StepFn = fn(&StepContext<'_>) -> anyhow::Result<()>;

#[derive(Clone)]
pub enum Action {
    /// Statements run as one batch.
    Sql(String),
    Code(StepFn),
}

impl Action {
    pub(crate) fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<()> {
        match self {
            Self::Sql(sql) => Ok(ctx.db.execute_batch(sql)?),
            Self::Code(f) => f(ctx),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::Code(_) => f.write_str("Code"),
        }
    }
}

/// One versioned migration. Steps without a down action are one-way.
#[derive(Debug, Clone)]
pub struct Step {
    pub version: i64,
    pub name: String,
    pub up_postgres: Option<Action>,
    pub up_sqlite: Option<Action>,
    pub down_postgres: Option<Action>,
}

impl Step {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up_postgres: None,
            up_sqlite: None,
            down_postgres: None,
        }
    }

    /// Same up action on both dialects.
    pub fn up(self, action: Action) -> Self {
        self.up_postgres(action.clone()).up_sqlite(action)
    }

    pub fn up_postgres(mut self, action: Action) -> Self {
        self.up_postgres = Some(action);
        self
    }

    pub fn up_sqlite(mut self, action: Action) -> Self {
        self.up_sqlite = Some(action);
        self
    }

    pub fn down_postgres(mut self, action: Action) -> Self {
        self.down_postgres = Some(action);
        self
    }

    pub(crate) fn up_for(&self, dialect: Dialect) -> Option<&Action> {
        match dialect {
            Dialect::Postgres => self.up_postgres.as_ref(),
            Dialect::Sqlite => self.up_sqlite.as_ref(),
        }
    }

    /// The embedded catalog only ever moves forward.
    pub(crate) fn down_for(&self, dialect: Dialect) -> Option<&Action> {
        match dialect {
            Dialect::Postgres => self.down_postgres.as_ref(),
            Dialect::Sqlite => None,
        }
    }
}

/// Ordered set of steps keyed by version.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    steps: BTreeMap<i64, Step>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The steps shipped with this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for step in steps::builtin() {
            registry.register(step);
        }
        registry
    }

    /// Adds a step, replacing any step registered under the same version.
    pub fn register(&mut self, step: Step) {
        self.steps.insert(step.version, step);
    }

    /// Drops every step above `version`.
    pub fn truncate(&mut self, version: i64) {
        self.steps.retain(|v, _| *v <= version);
    }

    pub fn get(&self, version: i64) -> Option<&Step> {
        self.steps.get(&version)
    }

    /// Smallest registered version strictly above `version`.
    pub fn next_after(&self, version: i64) -> Option<&Step> {
        self.steps.range(version + 1..).next().map(|(_, step)| step)
    }

    /// Largest registered version strictly below `version`.
    pub fn previous(&self, version: i64) -> Option<&Step> {
        self.steps.range(..version).next_back().map(|(_, step)| step)
    }

    pub fn base_version(&self) -> Option<i64> {
        self.steps.keys().next().copied()
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.steps.keys().next_back().copied()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    /// Registers the SQL steps found under `dir`.
    ///
    /// Each step is a directory named `<version>_<name>` holding any of
    /// `up_postgres.sql`, `up_sqlite.sql` and `down_postgres.sql`. Rust
    /// step stubs in the same tree are skipped; they are compiled in.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, MigrationError> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| MigrationError::Scaffold(e.to_string()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some((version, name)) = parse_step_dir(&entry.file_name().to_string_lossy())
            else {
                continue;
            };

            let mut step = Step::new(version, name);
            step.up_postgres = read_sql(&entry.path().join("up_postgres.sql"))?;
            step.up_sqlite = read_sql(&entry.path().join("up_sqlite.sql"))?;
            step.down_postgres = read_sql(&entry.path().join("down_postgres.sql"))?;
            self.register(step);
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// `000011_add_index` -> `(11, "add_index")`
pub(crate) fn parse_step_dir(name: &str) -> Option<(i64, String)> {
    let (version, rest) = name.split_once('_')?;
    let version = version.parse().ok()?;
    Some((version, rest.to_string()))
}

fn read_sql(path: &Path) -> Result<Option<Action>, MigrationError> {
    if !path.exists() {
        return Ok(None);
    }
    let sql = fs::read_to_string(path)
        .map_err(|e| MigrationError::Scaffold(format!("{}: {}", path.display(), e)))?;
    if sql.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Action::Sql(sql)))
}
