use anyhow::{bail, Context, Result};
use aqueduct_core::database::{self, DatabaseConfig};
use aqueduct_core::migrator::{self, Migrator, Registry, ScaffoldKind, SchemaVersion, DEFAULT_PYTHON};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Dialect {
    Postgres,
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "aqueduct-migrator")]
#[command(about = "Apply and scaffold Aqueduct catalog schema migrations", long_about = None)]
struct Args {
    /// Catalog database dialect
    #[arg(long, global = true, value_enum, default_value = "sqlite", env = "AQUEDUCT_DB_DIALECT")]
    dialect: Dialect,

    /// SQLite database file
    #[arg(long, global = true, default_value = "aqueduct.db", env = "AQUEDUCT_DB_PATH")]
    path: PathBuf,

    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "AQUEDUCT_DB_URL")]
    url: Option<String>,

    /// Directory of SQL migrations loaded in addition to the builtin steps
    #[arg(long, global = true, default_value = "migrations")]
    dir: PathBuf,

    /// Interpreter for steps that need the Python serializers
    #[arg(long, global = true, default_value = DEFAULT_PYTHON, env = "AQUEDUCT_PYTHON")]
    python: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scaffold a new migration with the next free version
    Create {
        name: String,
        /// `sql` or `rust`
        #[arg(value_name = "TYPE")]
        kind: ScaffoldKind,
    },
    /// Migrate up or down to a version
    Goto { version: i64 },
    /// Apply every pending migration
    Up,
    /// Undo the current migration
    Down,
    /// Print the current schema version
    Version,
}

impl Args {
    fn database(&self) -> Result<DatabaseConfig> {
        Ok(match self.dialect {
            Dialect::Sqlite => DatabaseConfig::Sqlite {
                path: self.path.clone(),
            },
            Dialect::Postgres => DatabaseConfig::Postgres {
                url: self
                    .url
                    .clone()
                    .context("--url is required for the postgres dialect")?,
            },
        })
    }

    fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::builtin();
        if self.dir.is_dir() {
            let loaded = registry
                .load_dir(&self.dir)
                .with_context(|| format!("Failed to load migrations from {}", self.dir.display()))?;
            tracing::debug!("Loaded {} migrations from {}", loaded, self.dir.display());
        }
        Ok(registry)
    }
}

fn report(head: &SchemaVersion) {
    println!(
        "{} {}{}",
        head.version,
        head.name,
        if head.dirty { " (dirty)" } else { "" }
    );
}

fn run(args: Args) -> Result<()> {
    let registry = args.registry()?;

    if let Command::Create { name, kind } = &args.command {
        let path = migrator::create(&args.dir, &registry, name, *kind)?;
        tracing::info!("Created {} migration at {}", kind, path.display());
        println!("{}", path.display());
        return Ok(());
    }

    let config = args.database()?;
    let db = database::open(&config).context("Failed to connect to the catalog")?;
    let migrator = Migrator::new(db, registry).with_python(args.python.clone());

    let head = match &args.command {
        Command::Goto { version } => migrator.goto(*version)?,
        Command::Up => migrator.up()?,
        Command::Down => migrator.down()?,
        Command::Version => migrator.version()?,
        Command::Create { .. } => bail!("create does not touch the catalog"),
    };
    report(&head);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aqueduct=info".into()),
        )
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
