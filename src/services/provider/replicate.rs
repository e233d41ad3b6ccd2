use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use super::{
    humanize, CompletionMode, InputMode, ProviderClient, ProviderError, ProviderKind,
    ProviderStatus, StagingProvider, SubmitContext,
};
use crate::config::ConfigError;
use crate::models::job::JobHandle;
use crate::models::staging::{SourceImage, StagingRequest};
use crate::services::normalizer::Normalizer;

const DEFAULT_BASE_URL: &str = "https://api.replicate.com";
const PREDICTIONS_PATH: &str = "/v1/predictions";
/// Interior design model used when none is configured.
const DEFAULT_MODEL_VERSION: &str =
    "17e07f89d07e6b8a44065b06e97af1b999c4e6a1e1ad3c29ebd4b05b1ad03e44";

/// Replicate predictions: polling completion, output at `output`.
///
/// Accepts the source image inline as a data URI.
pub struct ReplicateProvider {
    client: ProviderClient,
    model_version: String,
    normalizer: Normalizer,
}

impl ReplicateProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model_version: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: ProviderClient::new(
                base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                api_key,
                timeout,
            )?,
            model_version: model_version.unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
            normalizer: Normalizer::new(&["output"]),
        })
    }

    fn prompt(request: &StagingRequest) -> String {
        let style = request
            .design_style
            .as_deref()
            .map(humanize)
            .unwrap_or_else(|| "tastefully furnished".to_string());
        let mut prompt = format!(
            "A {style} {room}, professionally staged interior, photorealistic, high detail",
            room = humanize(&request.room_type)
        );
        if let Some(extra) = request.instructions.as_deref().map(str::trim) {
            if !extra.is_empty() {
                prompt.push_str(". ");
                prompt.push_str(extra);
            }
        }
        prompt
    }

    fn payload(&self, request: &StagingRequest) -> Value {
        let image = match &request.source {
            SourceImage::Url(url) => url.clone(),
            SourceImage::Bytes { data, content_type } => format!(
                "data:{content_type};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
        };

        json!({
            "version": self.model_version,
            "input": {
                "image": image,
                "prompt": Self::prompt(request),
                "num_outputs": request.variant_count,
            }
        })
    }

    fn status_from(&self, body: &Value) -> ProviderStatus {
        let raw_status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        match raw_status.as_str() {
            "succeeded" => ProviderStatus::Succeeded(body.clone()),
            "failed" | "canceled" => ProviderStatus::Failed {
                message: super::provider_message(body).map(|m| self.client.sanitize(&m)),
            },
            _ => ProviderStatus::InProgress { raw_status },
        }
    }
}

#[async_trait]
impl StagingProvider for ReplicateProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Replicate
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Polling
    }

    fn input_mode(&self) -> InputMode {
        InputMode::InlineBytes
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    async fn submit(
        &self,
        request: &StagingRequest,
        ctx: &SubmitContext,
    ) -> Result<JobHandle, ProviderError> {
        let body = self
            .client
            .send(
                self.client
                    .http()
                    .post(self.client.url(PREDICTIONS_PATH))
                    .bearer_auth(self.client.api_key())
                    .json(&self.payload(request)),
            )
            .await?;

        let mut handle = JobHandle::new(ctx.correlation_id, self.kind());
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            handle = handle.with_provider_job_id(id);
        }
        Ok(handle)
    }

    async fn poll_status(&self, provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        let body = self
            .client
            .send(
                self.client
                    .http()
                    .get(self.client.url(&format!("{PREDICTIONS_PATH}/{provider_job_id}")))
                    .bearer_auth(self.client.api_key()),
            )
            .await?;

        Ok(self.status_from(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ReplicateProvider {
        ReplicateProvider::new("r8_test".into(), None, None, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_inline_image_becomes_data_uri() {
        let request = StagingRequest {
            source: SourceImage::Bytes {
                data: vec![0xFF, 0xD8, 0xFF],
                content_type: "image/jpeg".into(),
            },
            room_type: "living_room".into(),
            design_style: Some("mid_century".into()),
            instructions: Some(" add a reading lamp ".into()),
            variant_count: 2,
        };
        let payload = provider().payload(&request);

        assert_eq!(payload["version"], DEFAULT_MODEL_VERSION);
        assert_eq!(payload["input"]["image"], "data:image/jpeg;base64,/9j/");
        assert_eq!(payload["input"]["num_outputs"], 2);
        let prompt = payload["input"]["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("A mid century living room"));
        assert!(prompt.ends_with(". add a reading lamp"));
    }

    #[test]
    fn test_status_mapping() {
        let p = provider();
        assert!(matches!(
            p.status_from(&serde_json::json!({ "status": "starting" })),
            ProviderStatus::InProgress { .. }
        ));
        assert_eq!(
            p.status_from(&serde_json::json!({ "status": "failed", "error": "NSFW content detected" })),
            ProviderStatus::Failed {
                message: Some("NSFW content detected".into())
            }
        );
    }

    #[test]
    fn test_completion_is_polling_only() {
        let p = provider();
        assert_eq!(p.completion_mode(), CompletionMode::Polling);

        let delivery = serde_json::json!({
            "id": "pred-1",
            "status": "succeeded",
            "output": ["https://replicate.delivery/a.png"]
        });
        assert!(matches!(
            p.parse_webhook(&delivery),
            Err(ProviderError::Validation(_))
        ));
    }
}
