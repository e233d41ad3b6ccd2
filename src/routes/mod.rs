pub mod health;
pub mod metrics;
pub mod stage;
pub mod webhook;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::models::job::ErrorKind;
use crate::services::ingress::IngressError;
use crate::services::provider::ProviderError;
use crate::services::staging::{CancelError, SubmitError};

/// Build the HTTP router. `/metrics` is mounted only when a recorder handle
/// is supplied.
pub fn router(
    state: AppState,
    prometheus: Option<Arc<PrometheusHandle>>,
    body_limit: usize,
) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/stage", post(stage::submit_stage))
        .route("/stage/upload", post(stage::submit_stage_upload))
        .route(
            "/stage/{correlation_id}",
            get(stage::get_stage_status).delete(stage::cancel_stage),
        )
        .route("/webhook", post(webhook::receive_webhook))
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
}

/// JSON error response: `{ "error": { "kind", "message" } }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::Validation, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, kind = %self.kind, error = %self.message, "Request failed");
        }
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        let kind = error.kind();
        let status = match &error {
            SubmitError::Ingress(IngressError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            SubmitError::Ingress(IngressError::UnsupportedFormat(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            SubmitError::Ingress(IngressError::Upload(_)) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Ingress(_) => StatusCode::BAD_REQUEST,
            SubmitError::Provider(ProviderError::Auth(_)) => StatusCode::BAD_GATEWAY,
            SubmitError::Provider(ProviderError::Validation(_)) => StatusCode::BAD_REQUEST,
            SubmitError::Provider(ProviderError::Quota(_)) => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::Provider(ProviderError::Transient(_)) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, kind, error.to_string())
    }
}

impl From<CancelError> for ApiError {
    fn from(error: CancelError) -> Self {
        let status = match error {
            CancelError::NotFound(_) => StatusCode::NOT_FOUND,
            CancelError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        };
        Self::new(status, ErrorKind::Validation, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::image_host::UploadError;

    #[test]
    fn test_submit_error_status_mapping() {
        let cases = [
            (
                SubmitError::Provider(ProviderError::Quota("out of credits".into())),
                StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Quota,
            ),
            (
                SubmitError::Provider(ProviderError::Auth("bad key".into())),
                StatusCode::BAD_GATEWAY,
                ErrorKind::Auth,
            ),
            (
                SubmitError::Ingress(IngressError::TooLarge { size: 20, limit: 10 }),
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorKind::Validation,
            ),
            (
                SubmitError::Ingress(IngressError::Upload(UploadError::Rejected("down".into()))),
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Upload,
            ),
        ];

        for (error, status, kind) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, status);
            assert_eq!(api.kind, kind);
        }
    }
}
