use anyhow::{bail, Context, Result};
use aqueduct_core::catalog::WorkflowRepository;
use aqueduct_core::database::{self, Database};
use aqueduct_core::job::{JobManagers, ProcessJobManager};
use aqueduct_core::migrator::{Migrator, Registry};
use aqueduct_core::retention::apply_retention;
use aqueduct_core::scheduler::CronManager;
use aqueduct_core::storage::StorageConfig;
use aqueduct_core::storage_migration::{cleanup_old_storage, migrate_storage};
use aqueduct_core::workflow::{register_dag, DagDefinition, Executor};
use aqueduct_core::ExecutionStatus;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

mod config;
mod trigger;

use config::ServerConfig;
use trigger::ScheduledRun;

#[derive(Parser, Debug)]
#[command(name = "aqueduct")]
#[command(about = "Aqueduct workflow orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "aqueduct.toml", env = "AQUEDUCT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy cron entries for scheduled workflows and run them until interrupted
    Serve,
    /// Register a DAG revision from a JSON definition
    Register {
        /// Owner of the workflow
        #[arg(long)]
        user: Uuid,
        /// DAG definition file
        file: PathBuf,
    },
    /// Run a DAG revision once
    Run {
        dag_id: Uuid,
        /// Parameter binding NAME=VALUE, repeatable
        #[arg(short, long = "param", value_parser = parse_binding)]
        params: Vec<(String, String)>,
        /// Execute without writing result rows
        #[arg(long)]
        preview: bool,
    },
    /// Move every live blob and secret to a new storage backend
    MigrateStorage {
        /// TOML file holding the new storage config
        to: PathBuf,
        /// Leave the copied content on the old storage
        #[arg(long)]
        keep_old: bool,
    },
    /// Apply every workflow's retention policy once
    Gc,
}

fn parse_binding(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))
}

/// Connect to the catalog and refuse a dirty schema.
fn open_catalog(config: &ServerConfig) -> Result<Arc<dyn Database>> {
    let db = database::open(&config.database).context("Failed to connect to the catalog")?;
    let migrator =
        Migrator::new(db.clone(), Registry::builtin()).with_python(config.engine.python.clone());
    let head = migrator.version()?;
    if head.dirty {
        bail!(
            "Schema version {} ({}) is dirty; fix it with aqueduct-migrator before starting",
            head.version,
            head.name
        );
    }
    if migrator.registry().latest_version().is_some_and(|latest| latest > head.version) {
        tracing::warn!(
            "Catalog schema is at version {}, older than this build expects",
            head.version
        );
    }
    Ok(db)
}

fn executor(config: &ServerConfig, db: Arc<dyn Database>) -> Executor {
    let local = ProcessJobManager::new(&config.engine.program, config.engine.args.clone());
    Executor::new(db, JobManagers::new(Arc::new(local)))
}

async fn serve(config: ServerConfig) -> Result<()> {
    let db = open_catalog(&config)?;
    let executor = Arc::new(executor(&config, db.clone()));
    let cron = CronManager::new(Arc::new(ScheduledRun {
        db: db.clone(),
        executor: executor.clone(),
        time_config: config.time.to_time_config(),
    }));

    for workflow in WorkflowRepository::list_with_schedule(db.as_ref())? {
        if let Err(e) = cron.sync(workflow.id, &workflow.schedule).await {
            tracing::error!("Skipping schedule of workflow {}: {}", workflow.name, e);
        }
    }
    tracing::info!("Serving {} cron entries", cron.entries().await.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    cron.shutdown().await;
    executor.shutdown();
    Ok(())
}

async fn run(
    config: ServerConfig,
    dag_id: Uuid,
    params: Vec<(String, String)>,
    preview: bool,
) -> Result<()> {
    let db = open_catalog(&config)?;
    let outcome = executor(&config, db)
        .run(
            dag_id,
            params.into_iter().collect::<HashMap<_, _>>(),
            &config.time.to_time_config(),
            preview,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome.dag_result)?);
    let status = outcome.status();
    if status != ExecutionStatus::Succeeded {
        match &outcome.error {
            Some(e) => bail!("Run {} {}: {}", outcome.dag_result.id, status, e),
            None => bail!("Run {} {}", outcome.dag_result.id, status),
        }
    }
    Ok(())
}

fn register(config: ServerConfig, user: Uuid, file: PathBuf) -> Result<()> {
    let db = open_catalog(&config)?;
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let definition: DagDefinition =
        serde_json::from_str(&content).context("Failed to parse DAG definition")?;
    let registration = register_dag(db.as_ref(), user, definition)?;
    tracing::info!(
        "Registered dag {} of workflow {}{}",
        registration.dag.id,
        registration.workflow.name,
        if registration.created_workflow { " (new workflow)" } else { "" }
    );
    println!("{}", registration.dag.id);
    Ok(())
}

async fn migrate(config: ServerConfig, to: PathBuf, keep_old: bool) -> Result<()> {
    let db = open_catalog(&config)?;
    let content = std::fs::read_to_string(&to)
        .with_context(|| format!("Failed to read {}", to.display()))?;
    let new_storage: StorageConfig =
        toml::from_str(&content).context("Failed to parse new storage config")?;
    let key = config.vault.key()?;

    let manifest = migrate_storage(db.as_ref(), &config.storage, &new_storage, &key).await?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    tracing::warn!("Point [storage] of the server config at the new storage before restarting");

    if keep_old {
        return Ok(());
    }
    let report = cleanup_old_storage(&manifest).await?;
    if !report.failed.is_empty() {
        bail!(
            "Migration committed, but {} old keys could not be deleted",
            report.failed.len()
        );
    }
    tracing::info!("Deleted {} keys from the old storage", report.deleted);
    Ok(())
}

async fn gc(config: ServerConfig) -> Result<()> {
    let db = open_catalog(&config)?;
    let mut failures = 0;
    for workflow in WorkflowRepository::list(db.as_ref())? {
        match apply_retention(db.as_ref(), &workflow).await {
            Ok(report) => failures += report.failed_blobs.len(),
            Err(e) => {
                tracing::error!("Retention of workflow {} failed: {}", workflow.name, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("Retention finished with {} failures", failures);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aqueduct=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;
    tracing::info!("Catalog: {:?}, storage: {}", config.database.dialect(), config.storage.describe());

    match args.command {
        Command::Serve => serve(config).await,
        Command::Register { user, file } => register(config, user, file),
        Command::Run {
            dag_id,
            params,
            preview,
        } => run(config, dag_id, params, preview).await,
        Command::MigrateStorage { to, keep_old } => migrate(config, to, keep_old).await,
        Command::Gc => gc(config).await,
    }
}
