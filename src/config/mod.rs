use std::time::Duration;

use serde::Deserialize;

use crate::services::provider::ProviderKind;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Public URL of this service; required for webhook-completing providers.
    pub public_base_url: Option<String>,

    /// Staging provider: instantdeco, reimaginehome or replicate
    pub provider: String,

    /// Provider API key
    pub provider_api_key: String,

    /// Override for the provider API base URL
    pub provider_base_url: Option<String>,

    /// Replicate model version hash
    pub replicate_model_version: Option<String>,

    /// Image host for providers that fetch by URL: imgbb or r2
    #[serde(default = "default_image_host")]
    pub image_host: String,

    /// ImgBB API key
    pub imgbb_api_key: Option<String>,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// Public URL prefix the R2 bucket is served from
    pub r2_public_url: Option<String>,

    #[serde(default = "default_job_max_wait_secs")]
    pub job_max_wait_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Added to the poll interval after every attempt (linear backoff).
    #[serde(default)]
    pub poll_backoff_step_ms: u64,

    #[serde(default = "default_poll_max_interval_secs")]
    pub poll_max_interval_secs: u64,

    /// Timeout for every individual outbound call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_submit_max_retries")]
    pub submit_max_retries: u32,

    #[serde(default = "default_submit_retry_base_ms")]
    pub submit_retry_base_ms: u64,

    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_image_retention_secs")]
    pub image_retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    #[serde(default = "default_min_image_dimension")]
    pub min_image_dimension: u32,

    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_image_host() -> String {
    "imgbb".to_string()
}

fn default_job_max_wait_secs() -> u64 {
    180
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_poll_max_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_submit_max_retries() -> u32 {
    2
}

fn default_submit_retry_base_ms() -> u64 {
    500
}

fn default_job_retention_secs() -> u64 {
    3600
}

fn default_image_retention_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_min_image_dimension() -> u32 {
    256
}

fn default_max_image_dimension() -> u32 {
    8192
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Polling loop timing.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub max_wait: Duration,
    pub interval: Duration,
    pub backoff_step: Duration,
    pub max_interval: Duration,
    pub request_timeout: Duration,
}

impl PollingConfig {
    /// Sleep before poll number `attempt` (0-based), with linear backoff.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        (self.interval + self.backoff_step * attempt).min(self.max_interval.max(self.interval))
    }
}

/// Caller-side retry policy for submissions.
#[derive(Debug, Clone)]
pub struct SubmitPolicy {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub request_timeout: Duration,
}

impl SubmitPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base * attempt
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub job_retention: Duration,
    pub image_retention: Duration,
    pub max_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct IngressLimits {
    pub max_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        self.provider
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown PROVIDER `{}`", self.provider)))
    }

    /// Reject settings that would make the service unable to resolve jobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.provider_kind()?;

        if kind == ProviderKind::InstantDeco && self.public_base_url.is_none() {
            return Err(ConfigError::Invalid(
                "PUBLIC_BASE_URL is required for webhook-based providers".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "POLL_INTERVAL_SECS and SWEEP_INTERVAL_SECS must be positive".into(),
            ));
        }
        if self.job_max_wait_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "JOB_MAX_WAIT_SECS and REQUEST_TIMEOUT_SECS must be positive".into(),
            ));
        }
        if self.min_image_dimension > self.max_image_dimension {
            return Err(ConfigError::Invalid(
                "MIN_IMAGE_DIMENSION exceeds MAX_IMAGE_DIMENSION".into(),
            ));
        }
        Ok(())
    }

    /// Callback URL handed to webhook providers for one job.
    pub fn webhook_base(&self) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(|base| format!("{}/webhook", base.trim_end_matches('/')))
    }

    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            max_wait: Duration::from_secs(self.job_max_wait_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
            backoff_step: Duration::from_millis(self.poll_backoff_step_ms),
            max_interval: Duration::from_secs(self.poll_max_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn submit_policy(&self) -> SubmitPolicy {
        SubmitPolicy {
            max_retries: self.submit_max_retries,
            retry_base: Duration::from_millis(self.submit_retry_base_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            job_retention: Duration::from_secs(self.job_retention_secs),
            image_retention: Duration::from_secs(self.image_retention_secs),
            max_wait: Duration::from_secs(self.job_max_wait_secs),
        }
    }

    pub fn ingress_limits(&self) -> IngressLimits {
        IngressLimits {
            max_bytes: self.max_image_bytes,
            min_dimension: self.min_image_dimension,
            max_dimension: self.max_image_dimension,
        }
    }
}
