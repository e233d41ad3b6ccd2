//! Scripted collaborators shared by the service unit tests.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::job::{JobHandle, JobRecord};
use crate::models::staging::StagingRequest;
use crate::services::completion::Finisher;
use crate::services::image_host::{HostedImage, ImageHost, TempImageRegistry, UploadError};
use crate::services::job_store::{InMemoryJobStore, JobStore};
use crate::services::normalizer::Normalizer;
use crate::services::provider::{
    CompletionMode, InputMode, ProviderError, ProviderKind, ProviderStatus, StagingProvider,
    SubmitContext, WebhookEvent,
};

/// Provider whose submit and poll responses are queued up front.
///
/// Output lives at `images`; once the poll script runs dry every poll reports
/// `running`.
pub(crate) struct ScriptedProvider {
    mode: CompletionMode,
    input: InputMode,
    normalizer: Normalizer,
    polls_script: Mutex<VecDeque<Result<ProviderStatus, ProviderError>>>,
    submits_script: Mutex<VecDeque<Result<(), ProviderError>>>,
    hang_polls: bool,
    pub polls: AtomicU32,
    pub submits: AtomicU32,
    pub last_webhook_url: Mutex<Option<String>>,
}

impl ScriptedProvider {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            input: InputMode::InlineBytes,
            normalizer: Normalizer::new(&["images"]),
            polls_script: Mutex::new(VecDeque::new()),
            submits_script: Mutex::new(VecDeque::new()),
            hang_polls: false,
            polls: AtomicU32::new(0),
            submits: AtomicU32::new(0),
            last_webhook_url: Mutex::new(None),
        }
    }

    pub fn with_polls(self, polls: Vec<Result<ProviderStatus, ProviderError>>) -> Self {
        *self.polls_script.lock().unwrap() = polls.into();
        self
    }

    pub fn with_submits(self, submits: Vec<Result<(), ProviderError>>) -> Self {
        *self.submits_script.lock().unwrap() = submits.into();
        self
    }

    pub fn with_input(mut self, input: InputMode) -> Self {
        self.input = input;
        self
    }

    /// Every poll blocks until its caller gives up.
    pub fn hanging(mut self) -> Self {
        self.hang_polls = true;
        self
    }
}

pub(crate) fn running() -> Result<ProviderStatus, ProviderError> {
    Ok(ProviderStatus::InProgress {
        raw_status: "running".into(),
    })
}

pub(crate) fn done(images: &[&str]) -> Result<ProviderStatus, ProviderError> {
    Ok(ProviderStatus::Succeeded(json!({ "status": "done", "images": images })))
}

#[async_trait]
impl StagingProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Replicate
    }

    fn completion_mode(&self) -> CompletionMode {
        self.mode
    }

    fn input_mode(&self) -> InputMode {
        self.input
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
        *self.last_webhook_url.lock().unwrap() = ctx.webhook_url.clone();
        let scripted = self.submits_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;
        Ok(JobHandle::new(ctx.correlation_id, self.kind()).with_provider_job_id(format!("job-{n}")))
    }

    async fn poll_status(&self, _provider_job_id: &str) -> Result<ProviderStatus, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.hang_polls {
            std::future::pending::<()>().await;
        }
        let scripted = self.polls_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(running)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookEvent, ProviderError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Validation("missing id".into()))?;
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("done") => ProviderStatus::Succeeded(payload.clone()),
            Some("failed") => ProviderStatus::Failed {
                message: payload.get("message").and_then(Value::as_str).map(str::to_string),
            },
            other => ProviderStatus::InProgress {
                raw_status: other.unwrap_or_default().to_string(),
            },
        };
        Ok(WebhookEvent {
            provider_job_id: Some(id.to_string()),
            correlation_id: None,
            status,
        })
    }
}

pub(crate) fn finisher() -> (Arc<InMemoryJobStore>, Finisher) {
    let store = Arc::new(InMemoryJobStore::new());
    let images = Arc::new(TempImageRegistry::new(None));
    let finisher = Finisher::new(store.clone(), images);
    (store, finisher)
}

/// Insert a pending record linked to `provider_job_id`.
pub(crate) async fn tracked_job(store: &InMemoryJobStore, provider_job_id: &str) -> JobHandle {
    let handle = JobHandle::new(Uuid::new_v4(), ProviderKind::Replicate)
        .with_provider_job_id(provider_job_id);
    store
        .insert(JobRecord::new(JobHandle {
            provider_job_id: None,
            ..handle.clone()
        }))
        .await
        .unwrap();
    store
        .attach_provider_id(handle.correlation_id, provider_job_id)
        .await
        .unwrap();
    handle
}

/// Image host that hands out predictable URLs and counts deletions.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub uploads: AtomicU32,
    pub deletes: AtomicU32,
}

#[async_trait]
impl ImageHost for RecordingHost {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn upload(&self, _data: &[u8], _content_type: &str) -> Result<HostedImage, UploadError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(HostedImage {
            url: format!("https://img.example.com/{n}.png"),
            delete_handle: Some(n.to_string()),
            uploaded_at: Utc::now(),
        })
    }

    async fn delete(&self, _image: &HostedImage) -> Result<(), UploadError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Blank PNG of the given size.
pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbImage::new(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
