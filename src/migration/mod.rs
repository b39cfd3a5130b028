//! Migration generation and execution
//!
//! Differences become risk-rated operations with paired rollbacks; the
//! executor runs them against a driver under a per-operation timeout.

mod executor;
mod generator;
pub mod sql;
mod types;

pub use executor::{apply_operation, apply_script};
pub use generator::{operation_id, risk_level, MigrationGenerator};
pub use types::{MigrationGeneratorOptions, MigrationOperation, MigrationScript, RiskLevel};
