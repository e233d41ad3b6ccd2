//! Staging orchestration: submit, status and cancel.
//!
//! A submission runs ingress, then the provider call (with the caller-side
//! retry policy), then records the job and spawns its completion strategy.
//! Synchronous failures surface to the caller and leave no job behind.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SubmitPolicy;
use crate::models::job::{ErrorKind, JobHandle, JobOutcome, JobRecord, JobStatus};
use crate::models::staging::StagingRequest;
use crate::services::completion::{CompletionStrategy, Finisher};
use crate::services::ingress::{ImageIngress, IngressError, RawImage};
use crate::services::job_store::{StoreError, TransitionOutcome};
use crate::services::provider::{CompletionMode, ProviderError, StagingProvider, SubmitContext};

/// Caller-supplied options of a staging request, minus the image.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub room_type: String,
    pub design_style: Option<String>,
    pub instructions: Option<String>,
    pub variant_count: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to record job: {0}")]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ingress(e) => e.kind(),
            Self::Provider(e) => e.kind(),
            Self::Store(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job is already {0}")]
    AlreadyTerminal(JobStatus),
}

pub struct StagingService {
    provider: Arc<dyn StagingProvider>,
    ingress: ImageIngress,
    strategy: Arc<dyn CompletionStrategy>,
    finisher: Finisher,
    policy: SubmitPolicy,
    webhook_base: Option<String>,
    shutdown: CancellationToken,
}

impl StagingService {
    pub fn new(
        provider: Arc<dyn StagingProvider>,
        ingress: ImageIngress,
        strategy: Arc<dyn CompletionStrategy>,
        finisher: Finisher,
        policy: SubmitPolicy,
        webhook_base: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            provider,
            ingress,
            strategy,
            finisher,
            policy,
            webhook_base,
            shutdown,
        }
    }

    pub fn provider(&self) -> &Arc<dyn StagingProvider> {
        &self.provider
    }

    pub fn finisher(&self) -> &Finisher {
        &self.finisher
    }

    /// Submit a staging request. Returns as soon as the provider accepted the
    /// job; completion is tracked in the background.
    pub async fn submit(
        &self,
        image: RawImage,
        options: StageOptions,
    ) -> Result<JobHandle, SubmitError> {
        let correlation_id = Uuid::new_v4();
        let images = self.finisher.images();

        let prepared = self.ingress.prepare(image, self.provider.input_mode()).await?;
        if let Some(hosted) = prepared.hosted {
            images.register(correlation_id, hosted);
        }

        let request = StagingRequest {
            source: prepared.source,
            room_type: options.room_type,
            design_style: options.design_style,
            instructions: options.instructions,
            variant_count: options.variant_count,
        };
        let ctx = SubmitContext {
            correlation_id,
            webhook_url: self.webhook_url(correlation_id),
        };

        let handle = match self.submit_with_retry(&request, &ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    provider = %self.provider.kind(),
                    kind = %e.kind(),
                    error = %e,
                    "Submission rejected"
                );
                images.release(correlation_id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.track(handle.clone()).await {
            tracing::error!(
                correlation_id = %correlation_id,
                provider_job_id = ?handle.provider_job_id,
                error = %e,
                "Accepted job could not be recorded"
            );
            images.release(correlation_id).await;
            return Err(e.into());
        }

        metrics::counter!("staging_jobs_submitted_total").increment(1);
        tracing::info!(
            correlation_id = %correlation_id,
            provider_job_id = ?handle.provider_job_id,
            provider = %self.provider.kind(),
            room_type = %request.room_type,
            variants = request.variant_count,
            "Staging job submitted"
        );

        Ok(handle)
    }

    /// Record the accepted job and start its completion strategy.
    async fn track(&self, handle: JobHandle) -> Result<(), StoreError> {
        let correlation_id = handle.correlation_id;
        let store = self.finisher.store();

        // Token first, so a webhook racing the insert can stop the strategy.
        let token = self.finisher.track(correlation_id, &self.shutdown);

        let unlinked = JobHandle {
            provider_job_id: None,
            ..handle.clone()
        };
        if let Err(e) = store.insert(JobRecord::new(unlinked)).await {
            self.finisher.stop_tracking(correlation_id);
            return Err(e);
        }
        metrics::gauge!("staging_jobs_in_flight").increment(1.0);

        if let Some(provider_job_id) = &handle.provider_job_id {
            if let Some(parked) = store.attach_provider_id(correlation_id, provider_job_id).await? {
                self.finisher.settle(&parked).await;
            }
        }

        let strategy = self.strategy.clone();
        let finisher = self.finisher.clone();
        tokio::spawn(async move {
            let outcome = strategy.run(handle, token).await;
            tracing::debug!(
                correlation_id = %correlation_id,
                outcome = ?outcome,
                "Completion tracking finished"
            );
            finisher.stop_tracking(correlation_id);
        });

        Ok(())
    }

    fn webhook_url(&self, correlation_id: Uuid) -> Option<String> {
        if self.provider.completion_mode() != CompletionMode::Webhook {
            return None;
        }
        self.webhook_base
            .as_ref()
            .map(|base| format!("{base}?correlation_id={correlation_id}"))
    }

    /// One adapter call per attempt; only transient failures are retried.
    async fn submit_with_retry(
        &self,
        request: &StagingRequest,
        ctx: &SubmitContext,
    ) -> Result<JobHandle, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::time::timeout(
                self.policy.request_timeout,
                self.provider.submit(request, ctx),
            )
            .await
            .unwrap_or_else(|_| Err(ProviderError::Transient("submission timed out".into())));

            match result {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient submission failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Current snapshot of a job. Never blocks on completion.
    pub async fn status(&self, correlation_id: Uuid) -> Option<JobRecord> {
        self.finisher.store().get(correlation_id).await
    }

    /// Stop tracking a job and mark it failed. The provider job itself keeps
    /// running; a late result for it is dropped.
    pub async fn cancel(&self, correlation_id: Uuid) -> Result<JobStatus, CancelError> {
        let outcome = JobOutcome::failed(
            ErrorKind::Cancelled,
            "tracking cancelled by caller; the provider may still finish the job",
        );
        match self.finisher.finish(correlation_id, outcome).await {
            TransitionOutcome::Applied { status, .. } => {
                tracing::info!(correlation_id = %correlation_id, "Job cancelled");
                Ok(status)
            }
            TransitionOutcome::AlreadyTerminal(status) => Err(CancelError::AlreadyTerminal(status)),
            _ => Err(CancelError::NotFound(correlation_id)),
        }
    }
}
