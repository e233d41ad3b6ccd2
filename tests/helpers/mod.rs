//! Test helpers: an in-process server wired to a stub staging provider.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use room_stager::app_state::AppState;
use room_stager::config::AppConfig;
use room_stager::models::job::JobHandle;
use room_stager::models::staging::StagingRequest;
use room_stager::routes;
use room_stager::services::job_store::InMemoryJobStore;
use room_stager::services::normalizer::Normalizer;
use room_stager::services::provider::{
    CompletionMode, InputMode, ProviderError, ProviderKind, ProviderStatus, StagingProvider,
    SubmitContext, WebhookEvent,
};

/// Provider stand-in. Jobs are named `stub-{n}`; polls report success with
/// two images; webhooks look like `{ "id", "status", "output", "error" }`.
pub struct StubProvider {
    mode: CompletionMode,
    normalizer: Normalizer,
    pub submits: AtomicU32,
}

impl StubProvider {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            normalizer: Normalizer::new(&["output"]),
            submits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StagingProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::InstantDeco
    }

    fn completion_mode(&self) -> CompletionMode {
        self.mode
    }

    fn input_mode(&self) -> InputMode {
        InputMode::InlineBytes
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    async fn submit(
        &self,
        _request: &StagingRequest,
        ctx: &SubmitContext,
    ) -> Result<JobHandle, ProviderError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(JobHandle::new(ctx.correlation_id, self.kind()).with_provider_job_id(format!("stub-{n}")))
    }

    async fn poll_status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        Ok(ProviderStatus::Succeeded(json!({
            "id": provider_job_id,
            "output": ["https://cdn.example.com/staged-1.png", "https://cdn.example.com/staged-2.png"],
        })))
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent, ProviderError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Validation("webhook without id".into()))?;
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("succeeded") => ProviderStatus::Succeeded(payload.clone()),
            Some("failed") => ProviderStatus::Failed {
                message: payload.get("error").and_then(Value::as_str).map(str::to_string),
            },
            other => ProviderStatus::InProgress {
                raw_status: other.unwrap_or("unknown").to_string(),
            },
        };
        Ok(WebhookEvent {
            provider_job_id: Some(id.to_string()),
            correlation_id: None,
            status,
        })
    }
}

/// Configuration with small image bounds and short timings.
pub fn test_config() -> AppConfig {
    serde_json::from_value(json!({
        "provider": "instantdeco",
        "provider_api_key": "test-key",
        "public_base_url": "http://stager.test",
        "job_max_wait_secs": 30,
        "poll_interval_secs": 1,
        "min_image_dimension": 16,
        "max_image_bytes": 512 * 1024,
    }))
    .expect("test config")
}

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub provider: Arc<StubProvider>,
    pub state: AppState,
    shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve the router on an ephemeral port.
pub async fn spawn_app(mode: CompletionMode) -> TestApp {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let provider = Arc::new(StubProvider::new(mode));
    let provider_dyn: Arc<dyn StagingProvider> = provider.clone();
    let state = AppState::new(
        provider_dyn,
        None,
        Arc::new(InMemoryJobStore::new()),
        &config,
        shutdown.clone(),
    );

    let app = routes::router(state.clone(), None, 1024 * 1024);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");

    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .expect("test server");
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        provider,
        state,
        shutdown,
    }
}

/// Poll `GET /stage/{id}` until the job leaves pending/processing.
pub async fn wait_for_terminal(
    client: &reqwest::Client,
    base_url: &str,
    correlation_id: &str,
    timeout_secs: u64,
) -> Result<Value, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 10;

    for _ in 0..max_attempts {
        let body: Value = client
            .get(format!("{base_url}/stage/{correlation_id}"))
            .send()
            .await?
            .json()
            .await?;

        match body["status"].as_str() {
            Some("pending") | Some("processing") => sleep(Duration::from_millis(100)).await,
            Some(_) => return Ok(body),
            None => return Err(format!("unexpected status body: {body}").into()),
        }
    }

    Err(format!("job did not resolve within {timeout_secs} seconds").into())
}
