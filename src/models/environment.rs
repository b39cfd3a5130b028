//! Environment DTOs

use crate::environment::{Environment, EnvironmentType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use validator::Validate;

static ENVIRONMENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").expect("environment name pattern"));

/// Request to register an environment
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterEnvironmentRequest {
    #[validate(length(min = 1, max = 128, message = "Environment name must be between 1 and 128 characters"))]
    #[validate(custom(function = "validate_environment_name"))]
    pub name: String,
    #[serde(rename = "type")]
    pub environment_type: EnvironmentType,
    #[validate(length(min = 1, max = 2048, message = "Connection reference is required"))]
    pub connection_ref: String,
    #[serde(default)]
    pub is_production: bool,
    #[serde(default)]
    pub allow_writes: Option<bool>,
}

impl RegisterEnvironmentRequest {
    pub fn into_environment(self) -> Environment {
        Environment::new(self.name, self.environment_type, self.connection_ref)
            .with_production_flag(self.is_production)
            .with_allow_writes(self.allow_writes)
    }
}

/// Environment names: letter first, then letters, digits, `_`, `.` or `-`
fn validate_environment_name(name: &str) -> Result<(), validator::ValidationError> {
    if !ENVIRONMENT_NAME.is_match(name) {
        let mut err = validator::ValidationError::new("invalid_environment_name");
        err.message = Some(
            "Invalid environment name. Must start with a letter and contain only letters, digits, '_', '.' or '-'."
                .into(),
        );
        return Err(err);
    }
    Ok(())
}
