//! Image Ingress: turns an uploaded room photo into something a provider can read.

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use image::ImageFormat;

use crate::config::IngressLimits;
use crate::models::job::ErrorKind;
use crate::models::staging::SourceImage;
use crate::services::image_host::{HostedImage, ImageHost, UploadError};
use crate::services::provider::InputMode;

/// An image as received from a caller.
#[derive(Debug, Clone)]
pub enum RawImage {
    /// `data:image/...;base64,` URI or bare base64.
    Encoded(String),
    Bytes(Vec<u8>),
    /// Already public URL; passed through untouched.
    Url(String),
}

/// Result of ingress: what to hand the provider, plus the hosted copy to clean
/// up later (if one was made).
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub source: SourceImage,
    pub hosted: Option<HostedImage>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("image is not valid base64 or data URI: {0}")]
    InvalidEncoding(String),

    #[error("image is {size} bytes; the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported image format: {0} (expected JPEG, PNG or WebP)")]
    UnsupportedFormat(String),

    #[error("image is {width}x{height}; each side must be between {min} and {max} pixels")]
    Dimensions {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid image URL: {0}")]
    InvalidUrl(String),

    #[error("no image supplied")]
    MissingImage,

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl IngressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Upload(_) => ErrorKind::Upload,
            _ => ErrorKind::Validation,
        }
    }
}

pub struct ImageIngress {
    limits: IngressLimits,
    host: Option<Arc<dyn ImageHost>>,
}

impl ImageIngress {
    pub fn new(limits: IngressLimits, host: Option<Arc<dyn ImageHost>>) -> Self {
        Self { limits, host }
    }

    pub fn limits(&self) -> &IngressLimits {
        &self.limits
    }

    /// Validate `raw` and shape it for a provider with the given input mode.
    ///
    /// Hosted-URL providers get the bytes uploaded to the image host; inline
    /// providers get the bytes directly.
    pub async fn prepare(
        &self,
        raw: RawImage,
        mode: InputMode,
    ) -> Result<PreparedImage, IngressError> {
        let data = match raw {
            RawImage::Url(url) => {
                return Ok(PreparedImage {
                    source: SourceImage::Url(validate_url(&url)?),
                    hosted: None,
                });
            }
            RawImage::Encoded(encoded) => self.decode(&encoded)?,
            RawImage::Bytes(data) => data,
        };

        let content_type = self.inspect(&data)?;

        match mode {
            InputMode::InlineBytes => Ok(PreparedImage {
                source: SourceImage::Bytes { data, content_type },
                hosted: None,
            }),
            InputMode::HostedUrl => {
                let host = self.host.as_ref().ok_or_else(|| {
                    UploadError::Rejected("no image host configured".to_string())
                })?;
                let hosted = host.upload(&data, &content_type).await?;
                tracing::debug!(
                    host = host.name(),
                    bytes = data.len(),
                    url = %hosted.url,
                    "Source image hosted"
                );
                Ok(PreparedImage {
                    source: SourceImage::Url(hosted.url.clone()),
                    hosted: Some(hosted),
                })
            }
        }
    }

    /// Decode a data URI or bare base64 string.
    pub fn decode(&self, encoded: &str) -> Result<Vec<u8>, IngressError> {
        let encoded = encoded.trim();
        let payload = match encoded.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    IngressError::InvalidEncoding("data URI has no payload".into())
                })?;
                if !header.ends_with(";base64") {
                    return Err(IngressError::InvalidEncoding(
                        "data URI is not base64-encoded".into(),
                    ));
                }
                payload
            }
            None => encoded,
        };

        if payload.is_empty() {
            return Err(IngressError::MissingImage);
        }

        // Reject oversized payloads before allocating the decoded buffer.
        let estimated = payload.len() / 4 * 3;
        if estimated > self.limits.max_bytes + 3 {
            return Err(IngressError::TooLarge {
                size: estimated,
                limit: self.limits.max_bytes,
            });
        }

        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| IngressError::InvalidEncoding(e.to_string()))
    }

    /// Check size, format and dimensions. Returns the sniffed MIME type.
    pub fn inspect(&self, data: &[u8]) -> Result<String, IngressError> {
        if data.is_empty() {
            return Err(IngressError::MissingImage);
        }
        if data.len() > self.limits.max_bytes {
            return Err(IngressError::TooLarge {
                size: data.len(),
                limit: self.limits.max_bytes,
            });
        }

        let format = image::guess_format(data)
            .map_err(|_| IngressError::UnsupportedFormat("unrecognized".into()))?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
            return Err(IngressError::UnsupportedFormat(format!("{format:?}")));
        }

        let (width, height) = image::ImageReader::with_format(Cursor::new(data), format)
            .into_dimensions()
            .map_err(|e| IngressError::InvalidEncoding(format!("unreadable image: {e}")))?;

        let (min, max) = (self.limits.min_dimension, self.limits.max_dimension);
        if width < min || height < min || width > max || height > max {
            return Err(IngressError::Dimensions {
                width,
                height,
                min,
                max,
            });
        }

        Ok(format.to_mime_type().to_string())
    }
}

fn validate_url(url: &str) -> Result<String, IngressError> {
    let parsed = reqwest::Url::parse(url.trim()).map_err(|e| IngressError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(IngressError::InvalidUrl(format!("unsupported scheme `{other}`"))),
    }
}
