//! Clone operation handlers

use crate::auth::{require_role, Claims, Role};
use crate::clone::CloneOperation;
use crate::error::{validation_error, ApiResult};
use crate::models::{StartCloneRequest, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Validate and start a clone; the pending operation is returned immediately
pub async fn start_clone(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<StartCloneRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<CloneOperation>>)> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let source = state.environments.get(payload.source_env_id).await?;
    let target = state.environments.get(payload.target_env_id).await?;
    let operation = state
        .orchestrator
        .start_clone(source, target, payload.options)
        .await?;
    info!("Clone {} started by {}", operation.id, claims.sub);

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::with_data("Clone started.", operation)),
    ))
}

pub async fn list_clones(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<Vec<CloneOperation>>>> {
    let operations = state.orchestrator.list().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} clone operations", operations.len()),
        operations,
    )))
}

pub async fn get_clone(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<CloneOperation>>> {
    let operation = state.orchestrator.get(id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Clone is {:?} at {}%", operation.status, operation.progress),
        operation,
    )))
}

pub async fn cancel_clone(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<CloneOperation>>> {
    require_role(&claims, Role::Operator)?;
    let operation = state.orchestrator.cancel(id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Cancellation requested; it takes effect at the next phase boundary.",
        operation,
    )))
}

pub async fn pause_clone(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<CloneOperation>>> {
    require_role(&claims, Role::Operator)?;
    let operation = state.orchestrator.pause(id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Pause requested; the clone stops before its next phase.",
        operation,
    )))
}

pub async fn resume_clone(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<CloneOperation>>> {
    require_role(&claims, Role::Operator)?;
    let operation = state.orchestrator.resume(id).await?;
    Ok(Json(SuccessResponse::with_data("Clone resumed.", operation)))
}
