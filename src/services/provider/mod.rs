//! Staging provider adapters.
//!
//! Every provider is driven through [`StagingProvider`]: one outbound call per
//! `submit`, one per `poll_status`, and parsing of inbound webhook payloads.
//! Adapters never retry; retry policy belongs to the caller because some
//! providers bill duplicate submissions.

mod instantdeco;
mod reimagine;
mod replicate;

pub use instantdeco::InstantDecoProvider;
pub use reimagine::ReimagineHomeProvider;
pub use replicate::ReplicateProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError};
use crate::models::job::{ErrorInfo, ErrorKind, JobHandle};
use crate::models::staging::StagingRequest;
use crate::services::normalizer::Normalizer;

const MAX_MESSAGE_LEN: usize = 200;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    InstantDeco,
    ReimagineHome,
    Replicate,
}

/// How a provider tells us a job has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompletionMode {
    Polling,
    Webhook,
}

/// How a provider wants the source image delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Provider fetches the image from a public URL.
    HostedUrl,
    /// Provider accepts the image inline (data URI in the request body).
    InlineBytes,
}

/// Per-submission values that are not part of the staging request itself.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub correlation_id: Uuid,
    pub webhook_url: Option<String>,
}

/// Provider-reported job state, from a poll response or a webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    InProgress { raw_status: String },
    /// Raw payload; the adapter's normalizer extracts the images.
    Succeeded(Value),
    Failed { message: Option<String> },
}

/// A parsed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub provider_job_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("provider rejected request: {0}")]
    Validation(String),

    #[error("provider quota exhausted: {0}")]
    Quota(String),

    #[error("provider temporarily unavailable: {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Quota(_) => ErrorKind::Quota,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Auth(m) | Self::Validation(m) | Self::Quota(m) | Self::Transient(m) => m,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth(message),
            402 | 429 => Self::Quota(message),
            400 | 404 | 409 | 413 | 415 | 422 => Self::Validation(message),
            _ => Self::Transient(message),
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.message())
    }
}

#[async_trait]
pub trait StagingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn completion_mode(&self) -> CompletionMode;

    fn input_mode(&self) -> InputMode;

    /// Normalizer configured with this provider's output path.
    fn normalizer(&self) -> &Normalizer;

    /// Submit a job. Exactly one outbound call, no retries.
    async fn submit(
        &self,
        request: &StagingRequest,
        ctx: &SubmitContext,
    ) -> Result<JobHandle, ProviderError>;

    /// Query the provider for the current state of a job.
    async fn poll_status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        Err(ProviderError::Validation(format!(
            "{} does not support status polling (job {provider_job_id})",
            self.kind()
        )))
    }

    /// Parse an inbound webhook payload.
    fn parse_webhook(&self, _payload: &Value) -> Result<WebhookEvent, ProviderError> {
        Err(ProviderError::Validation(format!(
            "{} does not deliver webhooks",
            self.kind()
        )))
    }
}

/// Build the adapter selected by configuration.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn StagingProvider>, ConfigError> {
    let kind = config.provider_kind()?;
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let key = config.provider_api_key.clone();
    let base = config.provider_base_url.clone();

    let provider: Arc<dyn StagingProvider> = match kind {
        ProviderKind::InstantDeco => Arc::new(InstantDecoProvider::new(key, base, timeout)?),
        ProviderKind::ReimagineHome => Arc::new(ReimagineHomeProvider::new(key, base, timeout)?),
        ProviderKind::Replicate => Arc::new(ReplicateProvider::new(
            key,
            base,
            config.replicate_model_version.clone(),
            timeout,
        )?),
    };

    tracing::info!(
        provider = %provider.kind(),
        completion_mode = %provider.completion_mode(),
        "Staging provider configured"
    );

    Ok(provider)
}

/// HTTP plumbing shared by the adapters.
pub(crate) struct ProviderClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub(crate) fn new(
        base_url: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("PROVIDER_API_KEY must not be empty".into()));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return its JSON body, classifying failures.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Value, ProviderError> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = body
                .as_ref()
                .and_then(provider_message)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("unexpected status")
                        .to_string()
                });
            return Err(ProviderError::from_status(status, self.sanitize(&message)));
        }

        body.ok_or_else(|| ProviderError::Transient("provider returned a non-JSON body".into()))
    }

    fn transport_error(&self, error: reqwest::Error) -> ProviderError {
        let reason = if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_connect() {
            "could not connect to provider".to_string()
        } else {
            self.sanitize(&error.to_string())
        };
        ProviderError::Transient(reason)
    }

    pub(crate) fn sanitize(&self, message: &str) -> String {
        sanitize_message(message, &self.api_key)
    }
}

/// Human-readable message from a provider error body, if any.
pub fn provider_message(body: &Value) -> Option<String> {
    let candidates = [
        body.get("error_message"),
        body.get("message"),
        body.get("detail"),
        body.get("error").filter(|v| v.is_string()),
        body.get("error").and_then(|e| e.get("message")),
        body.get("data").and_then(|d| d.get("error_message")),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|m| !m.is_empty())
        .map(str::to_string)
}

/// Redact the credential and bound the length of a provider message.
pub fn sanitize_message(message: &str, secret: &str) -> String {
    let redacted = if secret.len() >= 4 {
        message.replace(secret, "[redacted]")
    } else {
        message.to_string()
    };

    if redacted.chars().count() <= MAX_MESSAGE_LEN {
        return redacted;
    }
    let mut truncated: String = redacted.chars().take(MAX_MESSAGE_LEN).collect();
    truncated.push('…');
    truncated
}

/// `living_room` → `living room`
pub(crate) fn humanize(value: &str) -> String {
    value.replace(['_', '-'], " ").trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        let cases = [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (402, ErrorKind::Quota),
            (429, ErrorKind::Quota),
            (400, ErrorKind::Validation),
            (422, ErrorKind::Validation),
            (500, ErrorKind::Transient),
            (503, ErrorKind::Transient),
        ];
        for (code, kind) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(ProviderError::from_status(status, "x".into()).kind(), kind, "{code}");
        }
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(!ProviderError::Quota("x".into()).is_retryable());
    }

    #[test]
    fn test_provider_message_lookup() {
        assert_eq!(
            provider_message(&json!({ "error_message": "Invalid space type" })).as_deref(),
            Some("Invalid space type")
        );
        assert_eq!(
            provider_message(&json!({ "error": { "message": "bad image" } })).as_deref(),
            Some("bad image")
        );
        assert_eq!(provider_message(&json!({ "error": null, "detail": "  " })), None);
    }

    #[test]
    fn test_sanitize_redacts_and_truncates() {
        let msg = sanitize_message("invalid key sk-live-12345 supplied", "sk-live-12345");
        assert_eq!(msg, "invalid key [redacted] supplied");

        let long = "x".repeat(500);
        assert_eq!(sanitize_message(&long, "secret").chars().count(), MAX_MESSAGE_LEN + 1);
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("replicate".parse::<ProviderKind>().unwrap(), ProviderKind::Replicate);
        assert_eq!("InstantDeco".parse::<ProviderKind>().unwrap(), ProviderKind::InstantDeco);
        assert_eq!(ProviderKind::ReimagineHome.to_string(), "reimaginehome");
        assert!("dalle".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("living_room"), "living room");
        assert_eq!(humanize("Kids-Bedroom"), "kids bedroom");
    }
}
