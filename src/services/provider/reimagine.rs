use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{
    CompletionMode, InputMode, ProviderClient, ProviderError, ProviderKind, ProviderStatus,
    StagingProvider, SubmitContext,
};
use crate::config::ConfigError;
use crate::models::job::JobHandle;
use crate::models::staging::{SourceImage, StagingRequest};
use crate::services::normalizer::Normalizer;

const DEFAULT_BASE_URL: &str = "https://api.reimaginehome.ai";
const GENERATE_PATH: &str = "/v1/generate_image";

/// ReimagineHome: polling completion, images at `data.output_urls` or, on
/// older responses, `data.generated_images`.
pub struct ReimagineHomeProvider {
    client: ProviderClient,
    normalizer: Normalizer,
}

impl ReimagineHomeProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: ProviderClient::new(
                base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                api_key,
                timeout,
            )?,
            normalizer: Normalizer::new(&["data", "output_urls"])
                .or_path(&["data", "generated_images"]),
        })
    }

    fn payload(request: &StagingRequest) -> Result<Value, ProviderError> {
        let SourceImage::Url(image_url) = &request.source else {
            return Err(ProviderError::Validation(
                "ReimagineHome requires a hosted image URL".into(),
            ));
        };

        let mut payload = Map::new();
        payload.insert("image_url".into(), json!(image_url));
        payload.insert("space_type".into(), json!(request.room_type));
        payload.insert("mask_category".into(), json!("furnishing"));
        payload.insert("generation_count".into(), json!(request.variant_count));
        if let Some(theme) = &request.design_style {
            payload.insert("design_theme".into(), json!(theme));
        }
        if let Some(prompt) = &request.instructions {
            payload.insert("additional_prompt".into(), json!(prompt));
        }
        Ok(Value::Object(payload))
    }

    fn status_from(&self, body: &Value) -> ProviderStatus {
        let raw_status = body
            .pointer("/data/job_status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        match raw_status.as_str() {
            "done" | "completed" => ProviderStatus::Succeeded(body.clone()),
            "error" | "failed" => ProviderStatus::Failed {
                message: super::provider_message(body).map(|m| self.client.sanitize(&m)),
            },
            _ => ProviderStatus::InProgress { raw_status },
        }
    }
}

#[async_trait]
impl StagingProvider for ReimagineHomeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ReimagineHome
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Polling
    }

    fn input_mode(&self) -> InputMode {
        InputMode::HostedUrl
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    async fn submit(
        &self,
        request: &StagingRequest,
        ctx: &SubmitContext,
    ) -> Result<JobHandle, ProviderError> {
        let payload = Self::payload(request)?;

        let body = self
            .client
            .send(
                self.client
                    .http()
                    .post(self.client.url(GENERATE_PATH))
                    .header("api-key", self.client.api_key())
                    .json(&payload),
            )
            .await?;

        let mut handle = JobHandle::new(ctx.correlation_id, self.kind());
        if let Some(job_id) = body.pointer("/data/job_id").and_then(Value::as_str) {
            handle = handle.with_provider_job_id(job_id);
        }
        Ok(handle)
    }

    async fn poll_status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        let body = self
            .client
            .send(
                self.client
                    .http()
                    .get(self.client.url(&format!("{GENERATE_PATH}/{provider_job_id}")))
                    .header("api-key", self.client.api_key()),
            )
            .await?;

        Ok(self.status_from(&body))
    }
}
