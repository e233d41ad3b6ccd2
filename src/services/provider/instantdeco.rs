use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    CompletionMode, InputMode, ProviderClient, ProviderError, ProviderKind, ProviderStatus,
    StagingProvider, SubmitContext, WebhookEvent,
};
use crate::config::ConfigError;
use crate::models::job::JobHandle;
use crate::models::staging::{SourceImage, StagingRequest};
use crate::services::normalizer::Normalizer;

const DEFAULT_BASE_URL: &str = "https://app.instantdeco.ai";
const REQUEST_PATH: &str = "/api/1.1/wf/request_v2";
const DEFAULT_DESIGN: &str = "modern";
/// Structural elements kept unchanged when furnishing.
const BLOCKED_ELEMENTS: &str = "wall,floor,ceiling,windowpane,door";

/// InstantDecoAI: webhook-only completion, output at `output`.
pub struct InstantDecoProvider {
    client: ProviderClient,
    normalizer: Normalizer,
}

impl InstantDecoProvider {
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
            normalizer: Normalizer::new(&["output"]),
        })
    }

    fn payload(request: &StagingRequest, ctx: &SubmitContext) -> Result<Value, ProviderError> {
        let SourceImage::Url(img_url) = &request.source else {
            return Err(ProviderError::Validation(
                "InstantDeco requires a hosted image URL".into(),
            ));
        };
        let Some(webhook_url) = &ctx.webhook_url else {
            return Err(ProviderError::Validation(
                "InstantDeco requires a webhook URL".into(),
            ));
        };

        Ok(json!({
            "transformation_type": "furnish",
            "img_url": img_url,
            "room_type": request.room_type,
            "design": request.design_style.as_deref().unwrap_or(DEFAULT_DESIGN),
            "block_element": BLOCKED_ELEMENTS,
            "num_images": request.variant_count,
            "webhook_url": webhook_url,
        }))
    }
}

#[async_trait]
impl StagingProvider for InstantDecoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::InstantDeco
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Webhook
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
        let payload = Self::payload(request, ctx)?;

        let body = self
            .client
            .send(
                self.client
                    .http()
                    .post(self.client.url(REQUEST_PATH))
                    .bearer_auth(self.client.api_key())
                    .json(&payload),
            )
            .await?;

        // HTTP 200 with `status != success` is a rejected request.
        if body.get("status").and_then(Value::as_str) != Some("success") {
            let message = super::provider_message(&body)
                .unwrap_or_else(|| "request was not accepted".to_string());
            return Err(ProviderError::Validation(self.client.sanitize(&message)));
        }

        let mut handle = JobHandle::new(ctx.correlation_id, self.kind());
        if let Some(request_id) = body.pointer("/response/request_id").and_then(Value::as_str) {
            handle = handle.with_provider_job_id(request_id);
        }
        Ok(handle)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent, ProviderError> {
        let request_id = payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let raw_status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        if request_id.is_none() {
            return Err(ProviderError::Validation("webhook has no request_id".into()));
        }

        let status = match raw_status.as_str() {
            "succeeded" | "success" | "completed" | "done" => {
                ProviderStatus::Succeeded(payload.clone())
            }
            "failed" | "error" | "canceled" | "cancelled" => ProviderStatus::Failed {
                message: super::provider_message(payload).map(|m| self.client.sanitize(&m)),
            },
            _ => ProviderStatus::InProgress { raw_status },
        };

        Ok(WebhookEvent {
            provider_job_id: request_id,
            correlation_id: None,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn provider() -> InstantDecoProvider {
        InstantDecoProvider::new("test-key".into(), None, Duration::from_secs(5)).unwrap()
    }

    fn request(source: SourceImage) -> StagingRequest {
        StagingRequest {
            source,
            room_type: "living_room".into(),
            design_style: None,
            instructions: None,
            variant_count: 2,
        }
    }

    #[test]
    fn test_payload_shape() {
        let ctx = SubmitContext {
            correlation_id: Uuid::new_v4(),
            webhook_url: Some("https://stager.example.com/webhook".into()),
        };
        let payload = InstantDecoProvider::payload(
            &request(SourceImage::Url("https://img.example.com/r.jpg".into())),
            &ctx,
        )
        .unwrap();

        assert_eq!(payload["img_url"], "https://img.example.com/r.jpg");
        assert_eq!(payload["design"], DEFAULT_DESIGN);
        assert_eq!(payload["num_images"], 2);
        assert_eq!(payload["webhook_url"], "https://stager.example.com/webhook");
    }

    #[test]
    fn test_payload_requires_url_and_webhook() {
        let ctx = SubmitContext {
            correlation_id: Uuid::new_v4(),
            webhook_url: None,
        };
        let url_request = request(SourceImage::Url("https://img.example.com/r.jpg".into()));
        assert!(matches!(
            InstantDecoProvider::payload(&url_request, &ctx),
            Err(ProviderError::Validation(_))
        ));

        let bytes_request = request(SourceImage::Bytes {
            data: vec![1, 2, 3],
            content_type: "image/png".into(),
        });
        assert!(InstantDecoProvider::payload(&bytes_request, &ctx).is_err());
    }

    #[test]
    fn test_parse_webhook() {
        let p = provider();

        let done = p
            .parse_webhook(&serde_json::json!({
                "request_id": "req-1",
                "status": "succeeded",
                "output": "https://cdn/a.png,https://cdn/b.png"
            }))
            .unwrap();
        assert_eq!(done.provider_job_id.as_deref(), Some("req-1"));
        assert!(matches!(done.status, ProviderStatus::Succeeded(_)));

        let failed = p
            .parse_webhook(&serde_json::json!({
                "request_id": "req-2",
                "status": "failed",
                "message": "image could not be processed"
            }))
            .unwrap();
        assert_eq!(
            failed.status,
            ProviderStatus::Failed {
                message: Some("image could not be processed".into())
            }
        );

        assert!(p.parse_webhook(&serde_json::json!({ "status": "succeeded" })).is_err());
    }
}
