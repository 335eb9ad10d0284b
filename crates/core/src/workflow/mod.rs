//! DAG registration and execution.

mod artifact;
pub mod dag;
pub mod executor;
mod operator;
pub mod registration;

pub use dag::{DagDefinition, DagGraph, DagValidationError, EdgeDefinition};
pub use executor::{AqueductTimeConfig, ExecError, Executor, RunOutcome};
pub use registration::{register_dag, Registration, RegistrationError};
