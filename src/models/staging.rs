use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{ErrorInfo, JobRecord, JobStatus};

/// Where the provider reads the source room photo from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceImage {
    /// Publicly fetchable URL (caller-supplied or hosted by us).
    Url(String),
    /// Raw bytes for providers that accept inline images.
    Bytes { data: Vec<u8>, content_type: String },
}

/// Normalized request handed to a provider adapter. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct StagingRequest {
    pub source: SourceImage,
    pub room_type: String,
    pub design_style: Option<String>,
    pub instructions: Option<String>,
    pub variant_count: u8,
}

/// Normalized provider output. `images` is never empty on a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StagingResult {
    pub images: Vec<String>,
    pub provider_metadata: serde_json::Value,
}

fn default_variant_count() -> u8 {
    1
}

/// Body of `POST /stage`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StageRequestBody {
    /// Data URI (`data:image/png;base64,...`) or bare base64.
    #[garde(skip)]
    pub image: Option<String>,

    /// Already public image URL, used instead of `image`.
    #[garde(length(min = 8, max = 2048))]
    #[serde(alias = "image_url")]
    pub image_url: Option<String>,

    #[garde(length(min = 1, max = 64))]
    #[serde(alias = "room_type")]
    pub room_type: String,

    #[garde(length(min = 1, max = 64))]
    #[serde(alias = "design_style")]
    pub design_style: Option<String>,

    #[garde(length(max = 1000))]
    pub instructions: Option<String>,

    #[garde(range(min = 1, max = 4))]
    #[serde(default = "default_variant_count", alias = "variant_count")]
    pub variant_count: u8,
}

/// Response after submitting a staging request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResponse {
    pub correlation_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub correlation_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub elapsed_secs: f64,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl JobStatusResponse {
    pub fn from_record(record: &JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: record.correlation_id(),
            status: record.status,
            images: record.result.as_ref().map(|r| r.images.clone()),
            error: record.error.clone(),
            elapsed_secs: record.elapsed(now).num_milliseconds().max(0) as f64 / 1000.0,
            submitted_at: record.submitted_at,
            resolved_at: record.resolved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_accepts_both_casings() {
        let camel: StageRequestBody = serde_json::from_value(serde_json::json!({
            "imageUrl": "https://example.com/room.jpg",
            "roomType": "living_room",
            "designStyle": "modern",
            "variantCount": 2
        }))
        .unwrap();
        assert_eq!(camel.room_type, "living_room");
        assert_eq!(camel.variant_count, 2);

        let snake: StageRequestBody = serde_json::from_value(serde_json::json!({
            "image_url": "https://example.com/room.jpg",
            "room_type": "bedroom"
        }))
        .unwrap();
        assert_eq!(snake.design_style, None);
        assert_eq!(snake.variant_count, 1);
    }

    #[test]
    fn test_request_body_validation() {
        let body: StageRequestBody = serde_json::from_value(serde_json::json!({
            "imageUrl": "https://example.com/room.jpg",
            "roomType": "",
            "variantCount": 9
        }))
        .unwrap();
        assert!(body.validate().is_err());
    }
}
