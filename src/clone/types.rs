//! Clone operation records, options and results

use super::report::CloneReport;
use crate::error::AppError;
use crate::migration::MigrationScript;
use crate::schema::CollectOptions;
use crate::store::{Collection, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CloneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloneStatus::Completed | CloneStatus::Failed | CloneStatus::Cancelled)
    }
}

/// Workflow phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClonePhase {
    Safety,
    Schema,
    Data,
    Anonymization,
    Specialized,
    PostClone,
    Validation,
}

impl ClonePhase {
    pub const ALL: [ClonePhase; 7] = [
        ClonePhase::Safety,
        ClonePhase::Schema,
        ClonePhase::Data,
        ClonePhase::Anonymization,
        ClonePhase::Specialized,
        ClonePhase::PostClone,
        ClonePhase::Validation,
    ];

    /// Progress band `(start, end)` in percent
    pub fn band(&self) -> (u8, u8) {
        match self {
            ClonePhase::Safety => (0, 0),
            ClonePhase::Schema => (0, 30),
            ClonePhase::Data => (30, 70),
            ClonePhase::Anonymization => (70, 85),
            ClonePhase::Specialized => (85, 90),
            ClonePhase::PostClone => (90, 95),
            ClonePhase::Validation => (95, 100),
        }
    }

    /// Overall progress once `fraction` of this phase is done
    pub fn progress_at(&self, fraction: f64) -> u8 {
        let (start, end) = self.band();
        let span = f64::from(end - start) * fraction.clamp(0.0, 1.0);
        start + span.round() as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClonePhase::Safety => "safety",
            ClonePhase::Schema => "schema",
            ClonePhase::Data => "data",
            ClonePhase::Anonymization => "anonymization",
            ClonePhase::Specialized => "specialized",
            ClonePhase::PostClone => "post_clone",
            ClonePhase::Validation => "validation",
        }
    }
}

impl fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClonePhase>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneStatistics {
    pub schema_operations: usize,
    pub tables_cloned: usize,
    pub records_cloned: u64,
    pub records_anonymized: u64,
    pub specialized_systems: usize,
    pub specialized_records: u64,
    pub sequences_reset: usize,
    /// Rows copied per table key by the data phase
    pub table_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTiming {
    pub phase: ClonePhase,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub succeeded: bool,
}

/// How one column is masked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AnonymizationStrategy {
    Null,
    Fixed { value: Value },
    Hash,
    EmailMask,
    Randomize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizationRule {
    /// Table key, e.g. `public.customers`
    pub table: String,
    pub column: String,
    #[serde(flatten)]
    pub strategy: AnonymizationStrategy,
    /// A failing mandatory rule fails the clone instead of warning
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecializedSystemRequest {
    pub name: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneOptions {
    pub create_backup: bool,
    pub include_data: bool,
    /// Table keys to copy rows for; empty copies every table
    pub tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub anonymize_data: bool,
    pub anonymization_rules: Vec<AnonymizationRule>,
    pub specialized_systems: Vec<SpecializedSystemRequest>,
    pub safe_mode: bool,
    pub rebuild_indexes: bool,
    pub collect: CollectOptions,
    #[validate(range(min = 1, max = 86400, message = "operationTimeoutSecs must be between 1 and 86400"))]
    pub operation_timeout_secs: Option<u64>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            include_data: true,
            tables: Vec::new(),
            exclude_tables: Vec::new(),
            anonymize_data: false,
            anonymization_rules: Vec::new(),
            specialized_systems: Vec::new(),
            safe_mode: true,
            rebuild_indexes: false,
            collect: CollectOptions::default(),
            operation_timeout_secs: None,
        }
    }
}

impl CloneOptions {
    /// Whether the data phase copies rows of `table_key`
    pub fn copies_table(&self, table_key: &str) -> bool {
        (self.tables.is_empty() || self.tables.iter().any(|t| t == table_key))
            && !self.exclude_tables.iter().any(|t| t == table_key)
    }
}

/// Durable record of one clone run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneOperation {
    pub id: Uuid,
    pub source_env_id: Uuid,
    pub target_env_id: Uuid,
    pub status: CloneStatus,
    /// 0..=100, never decreasing while in progress
    pub progress: u8,
    #[serde(default)]
    pub current_phase: Option<ClonePhase>,
    #[serde(default)]
    pub statistics: CloneStatistics,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub timeline: Vec<PhaseTiming>,
    #[serde(default)]
    pub backup_id: Option<Uuid>,
    pub options: CloneOptions,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Record for CloneOperation {
    const COLLECTION: Collection = Collection::CloneOperations;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl CloneOperation {
    pub fn new(source_env_id: Uuid, target_env_id: Uuid, options: CloneOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_env_id,
            target_env_id,
            status: CloneStatus::Pending,
            progress: 0,
            current_phase: None,
            statistics: CloneStatistics::default(),
            logs: Vec::new(),
            timeline: Vec::new(),
            backup_id: None,
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn push_log(&mut self, level: LogLevel, phase: Option<ClonePhase>, message: impl Into<String>, details: Option<Value>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            phase,
            message: message.into(),
            details,
        });
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        Some((self.completed_at.unwrap_or_else(Utc::now) - started).num_milliseconds())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneIssue {
    pub severity: IssueSeverity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClonePhase>,
}

impl CloneIssue {
    pub fn from_error(error: &AppError, phase: Option<ClonePhase>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code: error.code().to_string(),
            message: error.to_string(),
            phase,
        }
    }

    pub fn warning(message: impl Into<String>, phase: Option<ClonePhase>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code: "WARNING".to_string(),
            message: message.into(),
            phase,
        }
    }
}

/// What happened to the target after a failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub backup_id: Uuid,
    pub attempted: bool,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResult {
    pub operation_id: Uuid,
    pub success: bool,
    pub status: CloneStatus,
    pub errors: Vec<CloneIssue>,
    pub warnings: Vec<String>,
    pub backup_id: Option<Uuid>,
    pub rollback: Option<RollbackOutcome>,
    pub migration_script: Option<MigrationScript>,
    pub statistics: CloneStatistics,
    pub report: CloneReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_phase_bands_are_contiguous() {
        let phases = &ClonePhase::ALL[1..];
        assert_eq!(phases[0].band().0, 0);
        for pair in phases.windows(2) {
            assert_eq!(pair[0].band().1, pair[1].band().0);
        }
        assert_eq!(ClonePhase::Validation.band().1, 100);
        assert_eq!(ClonePhase::Data.progress_at(0.5), 50);
        assert_eq!(ClonePhase::Schema.progress_at(2.0), 30);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: CloneOptions = serde_json::from_value(serde_json::json!({
            "excludeTables": ["public.audit_log"],
            "anonymizeData": true,
            "anonymizationRules": [
                {"table": "public.customers", "column": "email", "strategy": "email_mask", "mandatory": true},
                {"table": "public.customers", "column": "name", "strategy": "fixed", "value": "Jane Doe"}
            ]
        }))
        .unwrap();

        assert!(options.create_backup);
        assert!(options.safe_mode);
        assert_eq!(options.anonymization_rules[0].strategy, AnonymizationStrategy::EmailMask);
        assert_eq!(
            options.anonymization_rules[1].strategy,
            AnonymizationStrategy::Fixed { value: serde_json::json!("Jane Doe") }
        );
        assert!(options.copies_table("public.orders"));
        assert!(!options.copies_table("public.audit_log"));
    }
}
