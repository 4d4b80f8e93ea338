//! Target state endpoints

use axum::{
    Json,
    extract::{Path, State},
};

use crate::api::{
    ApiError, ApiResult, ApiState,
    types::{TargetStateResponse, TargetsResponse},
};

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> ApiResult<Json<TargetsResponse>> {
    let targets: Vec<TargetStateResponse> = state
        .status
        .target_states()
        .await?
        .into_iter()
        .map(|(target_id, state)| TargetStateResponse { target_id, state })
        .collect();

    Ok(Json(TargetsResponse {
        count: targets.len(),
        targets,
    }))
}

/// GET /api/v1/targets/:id/state
pub async fn get_target_state(
    State(state): State<ApiState>,
    Path(target_id): Path<String>,
) -> ApiResult<Json<TargetStateResponse>> {
    let current = state
        .status
        .current_state(&target_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("target '{target_id}' not found")))?;

    Ok(Json(TargetStateResponse {
        target_id,
        state: current,
    }))
}
