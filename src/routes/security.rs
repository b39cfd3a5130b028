//! Security alert feed

use crate::error::{validation_error, ApiResult};
use crate::models::{AlertsQuery, SuccessResponse};
use crate::safety::SecurityAlert;
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};
use validator::Validate;

const DEFAULT_ALERT_LIMIT: usize = 100;

/// Most recent refused accesses, newest first
pub async fn list_alerts(
    State(state): State<SharedState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<SecurityAlert>>>> {
    query.validate().map_err(|e| validation_error(e.to_string()))?;

    let alerts = state.guard.recent_alerts(query.limit.unwrap_or(DEFAULT_ALERT_LIMIT));
    Ok(Json(SuccessResponse::with_data(
        format!("{} alerts", alerts.len()),
        alerts,
    )))
}
