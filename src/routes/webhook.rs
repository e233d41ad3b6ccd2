use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::ApiError;
use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
}

/// POST /webhook — provider completion callback.
///
/// Always answers 200 for well-formed JSON, including unknown or duplicate
/// deliveries, so providers do not keep retrying.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid webhook payload: {e}")))?;

    let hint = query
        .correlation_id
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok());

    let ack = state.webhooks.ingest(&payload, hint).await;

    Ok(Json(json!({
        "status": "ok",
        "outcome": ack.as_str(),
    })))
}
