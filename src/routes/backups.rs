//! Backup, restore and rollback handlers

use crate::auth::{require_role, Claims, Role};
use crate::backup::{
    BackupMetadata, BackupValidation, GranularRollbackResult, RestoreResult, RestoreVerification, RollbackCheckpoint,
};
use crate::environment::EnvironmentStatus;
use crate::error::{validation_error, ApiResult};
use crate::models::{
    CreateBackupRequest, CreateCheckpointRequest, GranularRollbackRequest, ListBackupsQuery, SuccessResponse,
    VerifyRestoreRequest,
};
use crate::state::SharedState;
use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// Back up an environment
pub async fn create_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(env_id): Path<Uuid>,
    Json(payload): Json<CreateBackupRequest>,
) -> ApiResult<Json<SuccessResponse<BackupMetadata>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let environment = state.environments.get(env_id).await?;
    let backup = state.backups.create_backup(&environment, &payload.into()).await?;
    info!("Backup {} of {} created by {}", backup.id, environment.name, claims.sub);

    Ok(Json(SuccessResponse::with_data("Backup created.", backup)))
}

/// Backups of one environment, newest first
pub async fn list_backups(
    State(state): State<SharedState>,
    Path(env_id): Path<Uuid>,
    Query(query): Query<ListBackupsQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<BackupMetadata>>>> {
    let environment = state.environments.get(env_id).await?;
    let backups = state.backups.list_backups(Some(environment.id), query.validate).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} backups", backups.len()),
        backups,
    )))
}

pub async fn create_checkpoint(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(env_id): Path<Uuid>,
    Json(payload): Json<CreateCheckpointRequest>,
) -> ApiResult<Json<SuccessResponse<RollbackCheckpoint>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let environment = state.environments.get(env_id).await?;
    let checkpoint = state
        .backups
        .create_checkpoint(&environment, payload.scope, payload.targets, payload.operation_id)
        .await?;
    Ok(Json(SuccessResponse::with_data("Checkpoint created.", checkpoint)))
}

pub async fn validate_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<BackupValidation>>> {
    require_role(&claims, Role::Operator)?;
    let validation = state.backups.validate_backup(id).await?;
    let message = if validation.is_valid {
        "Backup is intact."
    } else {
        "Backup failed validation."
    };
    Ok(Json(SuccessResponse::with_data(message, validation)))
}

/// Full restore of the backed-up environment
pub async fn restore_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<RestoreResult>>> {
    require_role(&claims, Role::Admin)?;

    let backup = state.backups.get_backup(id).await?;
    let environment = state.environments.get(backup.environment_id).await?;
    warn!("Restore of {} from backup {} requested by {}", environment.name, id, claims.sub);

    state
        .environments
        .set_status(environment.id, EnvironmentStatus::Restoring)
        .await?;
    let result = state.backups.restore_backup(&environment, id).await;
    state
        .environments
        .set_status(environment.id, EnvironmentStatus::Active)
        .await?;

    Ok(Json(SuccessResponse::with_data("Environment restored.", result?)))
}

/// Roll back selected objects; each target succeeds or fails on its own
pub async fn rollback_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<GranularRollbackRequest>,
) -> ApiResult<Json<SuccessResponse<GranularRollbackResult>>> {
    require_role(&claims, Role::Admin)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let backup = state.backups.get_backup(id).await?;
    let environment = state.environments.get(backup.environment_id).await?;
    let result = state
        .backups
        .perform_granular_rollback(&environment, id, &payload.targets, &payload.options())
        .await?;

    let message = if result.success() {
        format!("{} targets rolled back.", result.results.len())
    } else {
        format!("{} of {} targets failed.", result.errors.len(), payload.targets.len())
    };
    Ok(Json(SuccessResponse::with_data(message, result)))
}

/// Restore-test a backup into a scratch environment
pub async fn verify_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<VerifyRestoreRequest>,
) -> ApiResult<Json<SuccessResponse<RestoreVerification>>> {
    require_role(&claims, Role::Operator)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let scratch = state.environments.get(payload.scratch_env_id).await?;
    let verification = state.backups.verify_restore(id, &scratch).await?;
    let message = if verification.verified {
        "Backup restores cleanly."
    } else {
        "Restore verification found problems."
    };
    Ok(Json(SuccessResponse::with_data(message, verification)))
}

pub async fn delete_backup(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<()>>> {
    require_role(&claims, Role::Admin)?;
    state.backups.delete_backup(id).await?;
    info!("Backup {} deleted by {}", id, claims.sub);
    Ok(Json(SuccessResponse::message_only("Backup deleted.")))
}
