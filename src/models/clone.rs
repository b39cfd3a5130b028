//! Clone DTOs

use crate::clone::CloneOptions;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Start cloning one environment into another
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_clone_request"))]
pub struct StartCloneRequest {
    pub source_env_id: Uuid,
    pub target_env_id: Uuid,
    #[serde(default)]
    #[validate(nested)]
    pub options: CloneOptions,
}

fn validate_clone_request(request: &StartCloneRequest) -> Result<(), validator::ValidationError> {
    super::distinct_environments(request.source_env_id, request.target_env_id)?;

    if request
        .options
        .anonymization_rules
        .iter()
        .any(|r| r.table.trim().is_empty() || r.column.trim().is_empty())
    {
        let mut err = validator::ValidationError::new("invalid_rule");
        err.message = Some("Every anonymization rule needs a table and a column".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clone_request_validation() {
        let id = Uuid::new_v4();
        let same: StartCloneRequest =
            serde_json::from_value(json!({"sourceEnvId": id, "targetEnvId": id})).unwrap();
        assert!(same.validate().is_err());

        let ok: StartCloneRequest = serde_json::from_value(json!({
            "sourceEnvId": Uuid::new_v4(),
            "targetEnvId": Uuid::new_v4(),
            "options": {"includeData": false}
        }))
        .unwrap();
        assert!(ok.validate().is_ok());
        assert!(!ok.options.include_data);
        assert!(ok.options.create_backup);

        let bad_rule: StartCloneRequest = serde_json::from_value(json!({
            "sourceEnvId": Uuid::new_v4(),
            "targetEnvId": Uuid::new_v4(),
            "options": {"anonymizationRules": [{"table": "", "column": "email", "strategy": "null"}]}
        }))
        .unwrap();
        assert!(bad_rule.validate().is_err());
    }

    #[test]
    fn test_clone_timeout_must_be_bounded() {
        let with_timeout = |secs: u64| -> StartCloneRequest {
            serde_json::from_value(json!({
                "sourceEnvId": Uuid::new_v4(),
                "targetEnvId": Uuid::new_v4(),
                "options": {"operationTimeoutSecs": secs}
            }))
            .unwrap()
        };

        assert!(with_timeout(0).validate().is_err());
        assert!(with_timeout(u64::MAX / 10).validate().is_err());
        assert!(with_timeout(600).validate().is_ok());
    }
}
