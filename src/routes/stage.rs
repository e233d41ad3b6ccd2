use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use garde::Validate;
use uuid::Uuid;

use super::ApiError;
use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::staging::{JobStatusResponse, StageRequestBody, StageResponse};
use crate::services::ingress::{IngressError, RawImage};
use crate::services::staging::StageOptions;

fn options(body: StageRequestBody) -> StageOptions {
    StageOptions {
        room_type: body.room_type,
        design_style: body.design_style,
        instructions: body.instructions.filter(|s| !s.trim().is_empty()),
        variant_count: body.variant_count,
    }
}

async fn submit(
    state: &AppState,
    image: RawImage,
    body: StageRequestBody,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let handle = state.staging.submit(image, options(body)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StageResponse {
            correlation_id: handle.correlation_id,
            status: JobStatus::Pending,
            message: "Staging job submitted".to_string(),
        }),
    ))
}

fn validated(body: &StageRequestBody) -> Result<(), ApiError> {
    body.validate()
        .map_err(|report| ApiError::bad_request(report.to_string()))
}

/// POST /stage — submit a staging request with a base64 image or image URL.
pub async fn submit_stage(
    State(state): State<AppState>,
    body: Result<Json<StageRequestBody>, JsonRejection>,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let Json(mut body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    validated(&body)?;

    let image = match (body.image_url.take(), body.image.take()) {
        (Some(url), _) => RawImage::Url(url),
        (None, Some(encoded)) => RawImage::Encoded(encoded),
        (None, None) => return Err(ApiError::bad_request(IngressError::MissingImage.to_string())),
    };

    submit(&state, image, body).await
}

/// POST /stage/upload — multipart variant: `image` file plus text fields.
pub async fn submit_stage_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut body = StageRequestBody {
        image: None,
        image_url: None,
        room_type: String::new(),
        design_style: None,
        instructions: None,
        variant_count: 1,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            image = Some(data.to_vec());
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        match name.as_str() {
            "room_type" | "roomType" => body.room_type = value,
            "design_style" | "designStyle" => body.design_style = Some(value),
            "instructions" => body.instructions = Some(value),
            "image_url" | "imageUrl" => body.image_url = Some(value),
            "variant_count" | "variantCount" => {
                body.variant_count = value
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::bad_request("variant_count must be a number"))?;
            }
            _ => {}
        }
    }

    validated(&body)?;

    let image = match (image, body.image_url.take()) {
        (Some(data), _) => RawImage::Bytes(data),
        (None, Some(url)) => RawImage::Url(url),
        (None, None) => return Err(ApiError::bad_request(IngressError::MissingImage.to_string())),
    };

    submit(&state, image, body).await
}

fn correlation_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|_| ApiError::not_found("unknown correlation id"))
}

/// GET /stage/{correlation_id} — current job state. Never blocks.
pub async fn get_stage_status(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let id = correlation_id(path)?;
    let record = state
        .staging
        .status(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;

    Ok(Json(JobStatusResponse::from_record(&record, Utc::now())))
}

/// DELETE /stage/{correlation_id} — stop tracking a job.
pub async fn cancel_stage(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let id = correlation_id(path)?;
    state.staging.cancel(id).await?;

    let record = state
        .staging
        .status(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    Ok(Json(JobStatusResponse::from_record(&record, Utc::now())))
}
