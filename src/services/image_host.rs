//! Public hosting for source images.
//!
//! Providers that fetch the room photo by URL need it reachable from the
//! internet. Hosted images are short-lived: every upload is registered in a
//! [`TempImageRegistry`] and deleted once its job resolves or its retention
//! window passes, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::multipart::{Form, Part};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError};

const IMGBB_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";

/// An image published by an [`ImageHost`].
#[derive(Debug, Clone, PartialEq)]
pub struct HostedImage {
    pub url: String,
    /// Host-specific handle used for deletion (object key, delete URL).
    pub delete_handle: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("image host request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image host rejected upload: {0}")]
    Rejected(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),
}

#[async_trait]
pub trait ImageHost: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upload(&self, data: &[u8], content_type: &str) -> Result<HostedImage, UploadError>;

    async fn delete(&self, image: &HostedImage) -> Result<(), UploadError>;
}

/// Build the image host selected by configuration.
pub fn build_image_host(config: &AppConfig) -> Result<Arc<dyn ImageHost>, ConfigError> {
    let retention = Duration::from_secs(config.image_retention_secs);
    let timeout = Duration::from_secs(config.request_timeout_secs);

    match config.image_host.to_ascii_lowercase().as_str() {
        "imgbb" => {
            let key = config.imgbb_api_key.clone().ok_or_else(|| {
                ConfigError::Invalid("IMGBB_API_KEY is required for IMAGE_HOST=imgbb".into())
            })?;
            Ok(Arc::new(ImgBbHost::new(key, retention, timeout)?))
        }
        "r2" => {
            let missing = |name: &str| ConfigError::Invalid(format!("{name} is required for IMAGE_HOST=r2"));
            Ok(Arc::new(R2Host::new(
                config.r2_bucket.as_deref().ok_or_else(|| missing("R2_BUCKET"))?,
                config.r2_endpoint.as_deref().ok_or_else(|| missing("R2_ENDPOINT"))?,
                config.r2_access_key.as_deref().ok_or_else(|| missing("R2_ACCESS_KEY"))?,
                config.r2_secret_key.as_deref().ok_or_else(|| missing("R2_SECRET_KEY"))?,
                config.r2_public_url.as_deref().ok_or_else(|| missing("R2_PUBLIC_URL"))?,
            )?))
        }
        other => Err(ConfigError::Invalid(format!("unknown IMAGE_HOST `{other}`"))),
    }
}

/// ImgBB-style host. Uploads expire host-side after the retention window.
pub struct ImgBbHost {
    http: reqwest::Client,
    api_key: String,
    expiration: Duration,
    endpoint: String,
}

impl ImgBbHost {
    pub fn new(api_key: String, expiration: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            expiration,
            endpoint: IMGBB_UPLOAD_URL.to_string(),
        })
    }
}

#[async_trait]
impl ImageHost for ImgBbHost {
    fn name(&self) -> &'static str {
        "imgbb"
    }

    async fn upload(&self, data: &[u8], content_type: &str) -> Result<HostedImage, UploadError> {
        let part = Part::bytes(data.to_vec())
            .file_name(format!("room_{}", Uuid::new_v4()))
            .mime_str(content_type)?;
        let form = Form::new().part("image", part);

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("expiration", &self.expiration.as_secs().to_string()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.without_url())?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| e.without_url())?;

        let url = body.pointer("/data/url").and_then(Value::as_str);
        match url {
            Some(url) if status.is_success() => Ok(HostedImage {
                url: url.to_string(),
                delete_handle: body
                    .pointer("/data/delete_url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                uploaded_at: Utc::now(),
            }),
            _ => {
                let message = body
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("no URL in response");
                Err(UploadError::Rejected(format!("{status}: {message}")))
            }
        }
    }

    /// ImgBB exposes deletion only as a web page; uploads expire on their own.
    async fn delete(&self, image: &HostedImage) -> Result<(), UploadError> {
        tracing::debug!(url = %image.url, "ImgBB image left to expire host-side");
        Ok(())
    }
}

/// Cloudflare R2 (S3-compatible) bucket served from a public URL prefix.
pub struct R2Host {
    bucket: Box<Bucket>,
    public_url: String,
}

impl R2Host {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_url: &str,
    ) -> Result<Self, ConfigError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| ConfigError::Invalid(format!("R2 credentials: {e}")))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| ConfigError::Invalid(format!("R2 bucket: {e}")))?;

        Ok(Self {
            bucket,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

#[async_trait]
impl ImageHost for R2Host {
    fn name(&self) -> &'static str {
        "r2"
    }

    async fn upload(&self, data: &[u8], content_type: &str) -> Result<HostedImage, UploadError> {
        let key = format!("staging/{}.{}", Uuid::new_v4(), extension_for(content_type));
        self.bucket
            .put_object_with_content_type(&key, data, content_type)
            .await?;

        Ok(HostedImage {
            url: format!("{}/{}", self.public_url, key),
            delete_handle: Some(key),
            uploaded_at: Utc::now(),
        })
    }

    async fn delete(&self, image: &HostedImage) -> Result<(), UploadError> {
        if let Some(key) = &image.delete_handle {
            self.bucket.delete_object(key).await?;
        }
        Ok(())
    }
}

/// Hosted source images awaiting deletion, keyed by correlation id.
pub struct TempImageRegistry {
    host: Option<Arc<dyn ImageHost>>,
    entries: DashMap<Uuid, HostedImage>,
}

impl TempImageRegistry {
    pub fn new(host: Option<Arc<dyn ImageHost>>) -> Self {
        Self {
            host,
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, correlation_id: Uuid, image: HostedImage) {
        self.entries.insert(correlation_id, image);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Correlation ids whose image was uploaded before `cutoff`.
    pub fn uploaded_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|entry| entry.value().uploaded_at < cutoff)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Delete the image registered for `correlation_id`, if any.
    ///
    /// Returns true when an entry was removed. Host failures are logged; the
    /// entry is dropped either way so a broken host cannot pin memory.
    pub async fn release(&self, correlation_id: Uuid) -> bool {
        let Some((_, image)) = self.entries.remove(&correlation_id) else {
            return false;
        };

        if let Some(host) = &self.host {
            if let Err(e) = host.delete(&image).await {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    host = host.name(),
                    error = %e,
                    "Failed to delete hosted image"
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHost {
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl ImageHost for CountingHost {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn upload(&self, _data: &[u8], _ct: &str) -> Result<HostedImage, UploadError> {
            Err(UploadError::Rejected("not used".into()))
        }

        async fn delete(&self, _image: &HostedImage) -> Result<(), UploadError> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn hosted(age_secs: i64) -> HostedImage {
        HostedImage {
            url: "https://img.example.com/x.jpg".into(),
            delete_handle: None,
            uploaded_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_release_deletes_once() {
        let host = Arc::new(CountingHost::default());
        let registry = TempImageRegistry::new(Some(host.clone()));
        let id = Uuid::new_v4();
        registry.register(id, hosted(0));

        assert!(registry.release(id).await);
        assert!(!registry.release(id).await);
        assert_eq!(host.deleted.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_uploaded_before() {
        let registry = TempImageRegistry::new(None);
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        registry.register(old, hosted(900));
        registry.register(fresh, hosted(10));

        let expired = registry.uploaded_before(Utc::now() - chrono::Duration::seconds(600));
        assert_eq!(expired, vec![old]);
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
    }
}
