// Core of the Aqueduct workflow orchestrator

pub mod types;
pub mod models;
pub mod database;
pub mod catalog;
pub mod migrator;
pub mod storage;
pub mod vault;
pub mod job;
pub mod workflow;
pub mod scheduler;
pub mod retention;
pub mod storage_migration;

pub use types::*;
