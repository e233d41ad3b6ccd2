use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::provider::{CompletionMode, ProviderKind};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub provider: ProviderKind,
    pub completion_mode: CompletionMode,
    pub jobs_tracked: usize,
}

/// GET /health — liveness plus the active provider configuration.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: state.provider,
        completion_mode: state.completion_mode,
        jobs_tracked: state.store.len().await,
    })
}
