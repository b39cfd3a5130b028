//! Migration data types

use crate::schema::{DiffAction, ObjectType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One executable, independently risk-rated unit of schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOperation {
    /// `{action}_{type}:{key}`, stable across runs
    pub id: String,
    pub description: String,
    pub object_type: ObjectType,
    pub action: DiffAction,
    /// `type:key` of the difference this operation performs
    pub object_key: String,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_sql: Option<String>,
    /// False when undoing the operation needs a backup rather than a script
    pub reversible: bool,
    /// Ids of operations that must have run first
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub estimated_duration_ms: u64,
    pub risk_level: RiskLevel,
    pub timeout_ms: u64,
}

/// Ordered operations plus their reverse-ordered rollbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationScript {
    /// SHA-256 of the ordered forward SQL
    pub id: String,
    pub operations: Vec<MigrationOperation>,
    pub rollback_operations: Vec<MigrationOperation>,
    pub risk_level: RiskLevel,
    pub estimated_duration_ms: u64,
    /// Ids of operations that cannot be undone by a generated script
    pub non_reversible: Vec<String>,
    pub requires_backup: bool,
    pub warnings: Vec<String>,
}

impl MigrationScript {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Forward SQL as a single document
    pub fn to_sql(&self) -> String {
        self.operations
            .iter()
            .map(|op| op.sql.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn rollback_sql(&self) -> String {
        self.rollback_operations
            .iter()
            .map(|op| op.sql.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationGeneratorOptions {
    pub include_rollback: bool,
    /// Prefix every statement with a `--` line describing it
    pub add_comments: bool,
    /// Emit `IF [NOT] EXISTS` and `OR REPLACE`, never `CASCADE`
    pub safe_mode: bool,
    pub operation_timeout_ms: u64,
}

impl Default for MigrationGeneratorOptions {
    fn default() -> Self {
        Self {
            include_rollback: true,
            add_comments: false,
            safe_mode: true,
            operation_timeout_ms: 300_000,
        }
    }
}

impl MigrationGeneratorOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
