use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    after_cancel, strategy_outcome, terminal_outcome, CompletionStrategy, Finisher,
    StrategyOutcome,
};
use crate::models::job::{JobHandle, JobOutcome, JobStatus};
use crate::services::job_store::TransitionOutcome;
use crate::services::provider::{CompletionMode, StagingProvider};

/// Waits for the provider's callback.
///
/// The only local work is a deadline watchdog: if no webhook resolves the job
/// within `max_wait` (e.g. the service is not reachable from the provider),
/// the job is timed out here.
pub struct WebhookStrategy {
    finisher: Finisher,
    max_wait: Duration,
}

impl WebhookStrategy {
    pub fn new(finisher: Finisher, max_wait: Duration) -> Self {
        Self { finisher, max_wait }
    }
}

#[async_trait]
impl CompletionStrategy for WebhookStrategy {
    fn mode(&self) -> CompletionMode {
        CompletionMode::Webhook
    }

    async fn run(&self, handle: JobHandle, cancel: CancellationToken) -> StrategyOutcome {
        let correlation_id = handle.correlation_id;
        let store = self.finisher.store();

        match store.mark_processing(correlation_id).await {
            TransitionOutcome::AlreadyTerminal(status) => return StrategyOutcome::Superseded(status),
            TransitionOutcome::NotFound => return StrategyOutcome::Untracked,
            _ => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => after_cancel(store, correlation_id).await,
            _ = tokio::time::sleep(self.max_wait) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    provider_job_id = ?handle.provider_job_id,
                    max_wait_secs = self.max_wait.as_secs(),
                    "No webhook received before deadline"
                );
                let transition = self
                    .finisher
                    .finish(correlation_id, JobOutcome::timed_out(self.max_wait))
                    .await;
                strategy_outcome(&transition)
            }
        }
    }
}

/// What an inbound webhook did. The HTTP response is 200 for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Terminal status written by this delivery.
    Applied(JobStatus),
    /// The job was already terminal; this delivery was dropped.
    Duplicate(JobStatus),
    /// Provider id not linked yet; kept until the submission records it.
    Parked,
    /// No job matches and none can be inferred.
    Unknown,
    /// Payload did not parse as this provider's callback.
    Ignored,
    /// Non-terminal progress report.
    Progress,
}

impl WebhookAck {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Duplicate(_) => "duplicate",
            Self::Parked => "parked",
            Self::Unknown => "unknown",
            Self::Ignored => "ignored",
            Self::Progress => "progress",
        }
    }
}

/// Ingests provider callbacks into the job store.
pub struct WebhookReceiver {
    provider: Arc<dyn StagingProvider>,
    finisher: Finisher,
}

impl WebhookReceiver {
    pub fn new(provider: Arc<dyn StagingProvider>, finisher: Finisher) -> Self {
        Self { provider, finisher }
    }

    /// Apply one delivery. `correlation_hint` is the id we embedded in the
    /// callback URL, used when the provider job id is not linked yet.
    pub async fn ingest(&self, payload: &Value, correlation_hint: Option<Uuid>) -> WebhookAck {
        metrics::counter!("staging_webhooks_received_total").increment(1);

        let event = match self.provider.parse_webhook(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unparseable webhook");
                return WebhookAck::Ignored;
            }
        };

        let fallback = event.correlation_id.or(correlation_hint);
        let provider_job_id = event.provider_job_id.as_deref();
        let store = self.finisher.store();

        let Some(outcome) = terminal_outcome(&event.status, self.provider.normalizer()) else {
            let linked = match provider_job_id {
                Some(pid) => store.find_by_provider_id(pid).await,
                None => None,
            };
            if let Some(correlation_id) = linked.or(fallback) {
                store.mark_processing(correlation_id).await;
            }
            return WebhookAck::Progress;
        };

        let transition = match (provider_job_id, fallback) {
            (Some(pid), _) => self.finisher.finish_by_provider_id(pid, outcome, fallback).await,
            (None, Some(correlation_id)) => self.finisher.finish(correlation_id, outcome).await,
            (None, None) => TransitionOutcome::NotFound,
        };

        match transition {
            TransitionOutcome::Applied { status, .. } => WebhookAck::Applied(status),
            TransitionOutcome::AlreadyTerminal(status) => {
                tracing::info!(
                    provider_job_id = ?provider_job_id,
                    status = %status,
                    "Dropping webhook for job that is already terminal"
                );
                WebhookAck::Duplicate(status)
            }
            TransitionOutcome::Parked => {
                tracing::warn!(
                    provider_job_id = ?provider_job_id,
                    "Webhook for unknown provider job parked"
                );
                WebhookAck::Parked
            }
            TransitionOutcome::NotFound | TransitionOutcome::Unchanged(_) => {
                tracing::warn!(
                    provider_job_id = ?provider_job_id,
                    correlation_id = ?fallback,
                    "Webhook matches no tracked job"
                );
                WebhookAck::Unknown
            }
        }
    }
}
