//! Health check endpoint

use axum::{Json, extract::State};

use crate::api::{ApiResult, ApiState, types::HealthResponse};

/// GET /api/v1/health
///
/// Always answers while the server runs; `status` reflects the queue backend.
pub async fn health_check(State(state): State<ApiState>) -> ApiResult<Json<HealthResponse>> {
    let backend = state.status.backend_health().await?;

    Ok(Json(HealthResponse {
        status: if backend.healthy { "ok" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        backend,
    }))
}
