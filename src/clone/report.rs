//! End-of-run clone report

use super::types::{
    CloneIssue, CloneOperation, CloneStatistics, CloneStatus, IssueSeverity, PhaseTiming, RollbackOutcome,
};
use crate::migration::MigrationScript;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub status: CloneStatus,
    pub success: bool,
    pub source_env_id: Uuid,
    pub target_env_id: Uuid,
    pub backup_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_count: usize,
    pub warning_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneReport {
    pub operation_id: Uuid,
    pub summary: ReportSummary,
    pub timeline: Vec<PhaseTiming>,
    pub statistics: CloneStatistics,
    pub issues: Vec<CloneIssue>,
    pub recommendations: Vec<String>,
}

impl CloneReport {
    pub fn build(
        operation: &CloneOperation,
        issues: &[CloneIssue],
        rollback: Option<&RollbackOutcome>,
        script: Option<&MigrationScript>,
    ) -> Self {
        let error_count = issues.iter().filter(|i| i.severity == IssueSeverity::Error).count();
        let summary = ReportSummary {
            status: operation.status,
            success: operation.status == CloneStatus::Completed,
            source_env_id: operation.source_env_id,
            target_env_id: operation.target_env_id,
            backup_id: operation.backup_id,
            started_at: operation.started_at,
            completed_at: operation.completed_at,
            duration_ms: operation.duration_ms(),
            error_count,
            warning_count: issues.len() - error_count,
        };

        Self {
            operation_id: operation.id,
            recommendations: recommendations(operation, rollback, script),
            summary,
            timeline: operation.timeline.clone(),
            statistics: operation.statistics.clone(),
            issues: issues.to_vec(),
        }
    }
}

fn recommendations(
    operation: &CloneOperation,
    rollback: Option<&RollbackOutcome>,
    script: Option<&MigrationScript>,
) -> Vec<String> {
    let mut out = Vec::new();

    if operation.status == CloneStatus::Failed {
        match rollback {
            Some(r) if !r.succeeded => out.push(format!(
                "Automatic restore failed; the target may be partially cloned. Restore backup {} manually before retrying.",
                r.backup_id
            )),
            Some(_) => out.push("Target was restored from its pre-clone backup; fix the reported error and retry.".to_string()),
            None => out.push(
                "No pre-clone backup existed, so the target was left as the failure found it. Enable createBackup for automatic rollback."
                    .to_string(),
            ),
        }
    }
    if operation.status == CloneStatus::Cancelled {
        out.push("Work committed before cancellation was kept; restore the pre-clone backup to undo it.".to_string());
    }

    if let Some(script) = script {
        if script.requires_backup && !operation.options.create_backup {
            out.push("The migration contains non-reversible operations; enable createBackup.".to_string());
        }
    }
    if operation.options.include_data && !operation.options.anonymize_data && operation.statistics.records_cloned > 0 {
        out.push("Data was copied without anonymization; configure anonymization rules for sensitive columns.".to_string());
    }
    if operation.statistics.records_cloned > 1_000_000 {
        out.push("Large data volume; consider the subset_copy system for faster refreshes.".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::types::{CloneOptions, ClonePhase};
    use crate::error::AppError;

    #[test]
    fn test_failed_run_without_backup_recommends_backups() {
        let mut operation = CloneOperation::new(Uuid::new_v4(), Uuid::new_v4(), CloneOptions::default());
        operation.status = CloneStatus::Failed;
        let issues = vec![
            CloneIssue::from_error(&AppError::OperationFailed("boom".to_string()), Some(ClonePhase::Data)),
            CloneIssue::warning("slow table", Some(ClonePhase::Data)),
        ];

        let report = CloneReport::build(&operation, &issues, None, None);
        assert!(!report.summary.success);
        assert_eq!(report.summary.error_count, 1);
        assert_eq!(report.summary.warning_count, 1);
        assert!(report.recommendations[0].contains("createBackup"));
    }

    #[test]
    fn test_failed_restore_is_called_out() {
        let mut operation = CloneOperation::new(Uuid::new_v4(), Uuid::new_v4(), CloneOptions::default());
        operation.status = CloneStatus::Failed;
        let rollback = RollbackOutcome {
            backup_id: Uuid::new_v4(),
            attempted: true,
            succeeded: false,
            error: Some("disk".to_string()),
        };
        let report = CloneReport::build(&operation, &[], Some(&rollback), None);
        assert!(report.recommendations[0].contains(&rollback.backup_id.to_string()));
    }
}
