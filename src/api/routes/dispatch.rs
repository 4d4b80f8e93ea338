//! Dispatch queue endpoints

use axum::{
    Json,
    extract::{Path, State},
};

use crate::api::{
    ApiError, ApiResult, ApiState,
    types::{DeadLetterInfo, DeadLettersResponse, RedriveResponse},
};
use crate::dispatch::{EntryId, QueueStats};

/// GET /api/v1/dispatch/stats
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.status.queue_stats().await?))
}

/// GET /api/v1/dispatch/dead-letters
pub async fn list_dead_letters(
    State(state): State<ApiState>,
) -> ApiResult<Json<DeadLettersResponse>> {
    let dead_letters: Vec<DeadLetterInfo> = state
        .status
        .dead_letters()
        .await?
        .into_iter()
        .map(DeadLetterInfo::from)
        .collect();

    Ok(Json(DeadLettersResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}

/// POST /api/v1/dispatch/dead-letters/:id/redrive
pub async fn redrive_dead_letter(
    State(state): State<ApiState>,
    Path(id): Path<EntryId>,
) -> ApiResult<Json<RedriveResponse>> {
    let receipt = state
        .status
        .redrive(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no dead letter with id {id}")))?;

    Ok(Json(RedriveResponse {
        redriven: id,
        entry_id: receipt.id,
        idempotency_key: receipt.idempotency_key,
    }))
}
