//! Schema comparison and migration preview handlers

use crate::auth::{require_role, Claims, Role};
use crate::environment::Environment;
use crate::error::{validation_error, ApiResult};
use crate::migration::{MigrationGenerator, MigrationScript};
use crate::models::{CompareSchemasRequest, GenerateMigrationRequest, SuccessResponse};
use crate::schema::{CollectOptions, SchemaComparator, SchemaDefinition, SchemaDiff};
use crate::state::SharedState;
use axum::{
    extract::{Extension, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

async fn collect_pair(
    state: &SharedState,
    source_id: Uuid,
    target_id: Uuid,
    options: &CollectOptions,
) -> ApiResult<(SchemaDefinition, SchemaDefinition)> {
    let source: Environment = state.environments.get(source_id).await?;
    let target: Environment = state.environments.get(target_id).await?;
    let source_schema = state.collector.collect(&source, options).await?;
    let target_schema = state.collector.collect(&target, options).await?;
    Ok((source_schema, target_schema))
}

/// Differences that would bring the target in line with the source
pub async fn compare_schemas(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CompareSchemasRequest>,
) -> ApiResult<Json<SuccessResponse<SchemaDiff>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let (source, target) =
        collect_pair(&state, payload.source_env_id, payload.target_env_id, &payload.collect).await?;
    let diff = SchemaComparator::compare(&source, &target, &payload.options)?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} differences", diff.differences.len()),
        diff,
    )))
}

/// Migration script preview; nothing is executed
pub async fn generate_migration(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<GenerateMigrationRequest>,
) -> ApiResult<Json<SuccessResponse<MigrationScript>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let (source, target) =
        collect_pair(&state, payload.source_env_id, payload.target_env_id, &payload.collect).await?;
    let diff = SchemaComparator::compare(&source, &target, &payload.options)?;
    let script = MigrationGenerator::generate(&diff, &payload.generator)?;

    Ok(Json(SuccessResponse::with_data(
        format!(
            "{} operations, risk {:?}, backup {}",
            script.operations.len(),
            script.risk_level,
            if script.requires_backup { "required" } else { "optional" }
        ),
        script,
    )))
}
