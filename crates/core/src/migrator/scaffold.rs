use super::registry::parse_step_dir;
use super::{MigrationError, Registry};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Shape of a new migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaffoldKind {
    /// A directory of per-dialect `.sql` files, loadable at runtime.
    Sql,
    /// A Rust step module to be registered in the builtin list.
    Rust,
}

impl FromStr for ScaffoldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "rust" => Ok(Self::Rust),
            other => Err(format!("unknown migration type: {} (expected sql or rust)", other)),
        }
    }
}

impl fmt::Display for ScaffoldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql => f.write_str("sql"),
            Self::Rust => f.write_str("rust"),
        }
    }
}

/// Scaffold an empty migration under `dir` using the next free version.
pub fn create(
    dir: &Path,
    registry: &Registry,
    name: &str,
    kind: ScaffoldKind,
) -> Result<PathBuf, MigrationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MigrationError::Scaffold(format!(
            "migration name must be non-empty [A-Za-z0-9_]: {:?}",
            name
        )));
    }
    let io = |e: std::io::Error| MigrationError::Scaffold(e.to_string());

    fs::create_dir_all(dir).map_err(io)?;
    let version = registry
        .latest_version()
        .unwrap_or(0)
        .max(highest_on_disk(dir)?)
        + 1;
    let stem = format!("{:06}_{}", version, name);

    match kind {
        ScaffoldKind::Sql => {
            let step_dir = dir.join(&stem);
            fs::create_dir(&step_dir).map_err(io)?;
            for file in ["up_postgres.sql", "up_sqlite.sql", "down_postgres.sql"] {
                fs::write(
                    step_dir.join(file),
                    format!("-- Migration {} ({}): {}\n", version, name, file),
                )
                .map_err(io)?;
            }
            Ok(step_dir)
        }
        ScaffoldKind::Rust => {
            let path = dir.join(format!("{}.rs", stem));
            fs::write(&path, rust_stub(version, name)).map_err(io)?;
            Ok(path)
        }
    }
}

fn highest_on_disk(dir: &Path) -> Result<i64, MigrationError> {
    let mut highest = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| MigrationError::Scaffold(e.to_string()))?;
        let file_name = entry.file_name().to_string_lossy();
        let stem = file_name.strip_suffix(".rs").unwrap_or(&file_name);
        if let Some((version, _)) = parse_step_dir(stem) {
            highest = highest.max(version);
        }
    }
    Ok(highest)
}

fn rust_stub(version: i64, name: &str) -> String {
    format!(
        r#"use aqueduct_core::migrator::{{Action, Step, StepContext}};

pub fn step() -> Step {{
    Step::new({version}, "{name}")
        .up_postgres(Action::Code(up_postgres))
        .up_sqlite(Action::Code(up_sqlite))
        .down_postgres(Action::Code(down_postgres))
}}

fn up_postgres(ctx: &StepContext<'_>) -> anyhow::Result<()> {{
    let _ = ctx;
    Ok(())
}}

fn up_sqlite(ctx: &StepContext<'_>) -> anyhow::Result<()> {{
    let _ = ctx;
    Ok(())
}}

fn down_postgres(ctx: &StepContext<'_>) -> anyhow::Result<()> {{
    let _ = ctx;
    Ok(())
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sql_scaffold_uses_next_version() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::builtin();
        let next = registry.latest_version().unwrap() + 1;

        let first = create(dir.path(), &registry, "add_index", ScaffoldKind::Sql).unwrap();
        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            format!("{:06}_add_index", next)
        );
        assert!(first.join("up_sqlite.sql").exists());
        assert!(first.join("down_postgres.sql").exists());

        let second = create(dir.path(), &registry, "backfill", ScaffoldKind::Rust).unwrap();
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            format!("{:06}_backfill.rs", next + 1)
        );
        let stub = fs::read_to_string(&second).unwrap();
        assert!(stub.contains(&format!("Step::new({}, \"backfill\")", next + 1)));
    }

    #[test]
    fn test_scaffold_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let err = create(dir.path(), &Registry::new(), "../escape", ScaffoldKind::Sql).unwrap_err();
        assert!(matches!(err, MigrationError::Scaffold(_)));
        assert!("go".parse::<ScaffoldKind>().is_err());
    }
}
