//! Schema comparison DTOs

use crate::migration::MigrationGeneratorOptions;
use crate::schema::{CollectOptions, ComparisonOptions};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Compare the schema of one environment against another
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompareSchemasRequest {
    pub source_env_id: Uuid,
    pub target_env_id: Uuid,
    #[serde(default)]
    pub options: ComparisonOptions,
    #[serde(default)]
    pub collect: CollectOptions,
}

/// Generate the migration that brings the target in line with the source
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_migration_request"))]
pub struct GenerateMigrationRequest {
    pub source_env_id: Uuid,
    pub target_env_id: Uuid,
    #[serde(default)]
    pub options: ComparisonOptions,
    #[serde(default)]
    pub collect: CollectOptions,
    #[serde(default)]
    pub generator: MigrationGeneratorOptions,
}

fn validate_migration_request(request: &GenerateMigrationRequest) -> Result<(), validator::ValidationError> {
    super::distinct_environments(request.source_env_id, request.target_env_id)
}
