//! Environment route handlers
//!
//! Registration, lookup, production classification and schema snapshots.

use crate::auth::{require_role, Claims, Role};
use crate::environment::EnvironmentInfo;
use crate::error::{validation_error, ApiResult};
use crate::models::{RegisterEnvironmentRequest, SuccessResponse};
use crate::safety::Classification;
use crate::schema::{CollectOptions, SchemaDefinition};
use crate::state::SharedState;
use axum::{
    extract::{Extension, Path, State},
    Json,
};
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

/// Register an environment
pub async fn register_environment(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RegisterEnvironmentRequest>,
) -> ApiResult<Json<SuccessResponse<EnvironmentInfo>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let environment = state.environments.register(payload.into_environment()).await?;
    info!("Environment {} registered by {}", environment.name, claims.sub);

    Ok(Json(SuccessResponse::with_data(
        "Environment registered successfully.",
        EnvironmentInfo::from(&environment),
    )))
}

/// List registered environments
pub async fn list_environments(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<Vec<EnvironmentInfo>>>> {
    let environments: Vec<EnvironmentInfo> = state
        .environments
        .list()
        .await?
        .iter()
        .map(EnvironmentInfo::from)
        .collect();

    Ok(Json(SuccessResponse::with_data(
        format!("{} environments", environments.len()),
        environments,
    )))
}

pub async fn get_environment(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<EnvironmentInfo>>> {
    let environment = state.environments.get(id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Environment found.",
        EnvironmentInfo::from(&environment),
    )))
}

/// Effective type and the production signals that fired
pub async fn classify_environment(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Classification>>> {
    let environment = state.environments.get(id).await?;
    let classification = state.guard.classify(&environment);
    Ok(Json(SuccessResponse::with_data(
        format!("Environment is {}", classification.effective_type),
        classification,
    )))
}

/// Collect a read-only schema snapshot
pub async fn environment_schema(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<SchemaDefinition>>> {
    let environment = state.environments.get(id).await?;
    debug!("Collecting schema of {}", environment.name);

    let schema = state
        .collector
        .collect(&environment, &CollectOptions::default())
        .await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Schema collected ({} tables)", schema.tables.len()),
        schema,
    )))
}
