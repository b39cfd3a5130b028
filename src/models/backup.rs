//! Backup and rollback DTOs

use crate::backup::{BackupOptions, RollbackOptions, RollbackScope, RollbackTarget};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

fn default_true() -> bool {
    true
}

/// Request to back up an environment
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub scope: RollbackScope,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_true")]
    pub include_data: bool,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
}

impl From<CreateBackupRequest> for BackupOptions {
    fn from(request: CreateBackupRequest) -> Self {
        BackupOptions {
            scope: request.scope,
            tables: request.tables,
            include_data: request.include_data,
            description: request.description,
        }
    }
}

/// Request to create a scoped restore point
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckpointRequest {
    pub scope: RollbackScope,
    #[serde(default)]
    #[validate(length(max = 1000, message = "At most 1000 targets per checkpoint"))]
    pub targets: Vec<String>,
    pub operation_id: Option<Uuid>,
}

/// Request to roll back selected objects from a backup
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GranularRollbackRequest {
    #[validate(length(min = 1, message = "At least one rollback target is required"))]
    pub targets: Vec<RollbackTarget>,
    #[serde(default)]
    pub preserve_new_data: bool,
}

impl GranularRollbackRequest {
    pub fn options(&self) -> RollbackOptions {
        RollbackOptions {
            preserve_new_data: self.preserve_new_data,
        }
    }
}

/// Request to restore-test a backup into a scratch environment
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRestoreRequest {
    pub scratch_env_id: Uuid,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListBackupsQuery {
    #[serde(default)]
    pub validate: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AlertsQuery {
    #[validate(range(min = 1, max = 1000, message = "limit must be between 1 and 1000"))]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backup_request_defaults() {
        let request: CreateBackupRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.validate().is_ok());
        let options = BackupOptions::from(request);
        assert_eq!(options.scope, RollbackScope::Full);
        assert!(options.include_data);
    }

    #[test]
    fn test_rollback_request_needs_targets() {
        let empty: GranularRollbackRequest = serde_json::from_value(json!({"targets": []})).unwrap();
        assert!(empty.validate().is_err());

        let request: GranularRollbackRequest = serde_json::from_value(json!({
            "targets": [{"scope": "table", "name": "public.orders"}],
            "preserveNewData": true
        }))
        .unwrap();
        assert!(request.validate().is_ok());
        assert!(request.options().preserve_new_data);
    }
}
