//! Completion strategies: how the service learns a provider job has finished.
//!
//! Both variants sit behind [`CompletionStrategy`], so the staging service
//! spawns one `run` per job without caring which the provider uses. Every
//! terminal write goes through [`Finisher`], which owns the follow-up work
//! (metrics, releasing the hosted source image) for writes that actually won.

mod polling;
mod webhook;

pub use polling::PollingStrategy;
pub use webhook::{WebhookAck, WebhookReceiver, WebhookStrategy};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{ErrorKind, JobHandle, JobOutcome, JobStatus};
use crate::services::image_host::TempImageRegistry;
use crate::services::job_store::{JobStore, TransitionOutcome};
use crate::services::normalizer::Normalizer;
use crate::services::provider::{CompletionMode, ProviderStatus};

/// How a strategy run ended, from the strategy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// This run wrote the terminal status.
    Resolved(JobStatus),
    /// This run gave up waiting and wrote `TimedOut`.
    TimedOut,
    /// Tracking was cancelled before the job resolved.
    Cancelled,
    /// Someone else (webhook, cancel, sweeper) wrote the terminal status first.
    Superseded(JobStatus),
    /// The record is gone from the store (reaped or never inserted).
    Untracked,
}

#[async_trait]
pub trait CompletionStrategy: Send + Sync {
    fn mode(&self) -> CompletionMode;

    /// Drive one job until it is terminal, the deadline passes or `cancel` fires.
    async fn run(&self, handle: JobHandle, cancel: CancellationToken) -> StrategyOutcome;
}

/// Terminal writes plus their side effects.
///
/// Also owns the cancellation token of every job still being tracked, so that
/// whichever writer resolves a job first stops its poll loop or watchdog.
#[derive(Clone)]
pub struct Finisher {
    store: Arc<dyn JobStore>,
    images: Arc<TempImageRegistry>,
    trackers: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Finisher {
    pub fn new(store: Arc<dyn JobStore>, images: Arc<TempImageRegistry>) -> Self {
        Self {
            store,
            images,
            trackers: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn images(&self) -> &Arc<TempImageRegistry> {
        &self.images
    }

    /// Register a tracking token for a job, derived from `parent`.
    pub fn track(&self, correlation_id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.trackers.insert(correlation_id, token.clone());
        token
    }

    /// Cancel and forget the job's tracking token. Returns false if untracked.
    pub fn stop_tracking(&self, correlation_id: Uuid) -> bool {
        match self.trackers.remove(&correlation_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }

    pub async fn finish(&self, correlation_id: Uuid, outcome: JobOutcome) -> TransitionOutcome {
        let transition = self.store.finish(correlation_id, outcome).await;
        self.settle(&transition).await;
        transition
    }

    pub async fn finish_by_provider_id(
        &self,
        provider_job_id: &str,
        outcome: JobOutcome,
        fallback: Option<Uuid>,
    ) -> TransitionOutcome {
        let transition = self
            .store
            .finish_by_provider_id(provider_job_id, outcome, fallback)
            .await;
        self.settle(&transition).await;
        transition
    }

    /// Record a transition applied elsewhere (e.g. a parked webhook replayed
    /// on provider-id attach). No-op unless the transition is terminal.
    pub async fn settle(&self, transition: &TransitionOutcome) {
        let TransitionOutcome::Applied {
            correlation_id,
            status,
        } = *transition
        else {
            return;
        };
        if !status.is_terminal() {
            return;
        }

        match status {
            JobStatus::Completed => metrics::counter!("staging_jobs_completed_total").increment(1),
            JobStatus::TimedOut => metrics::counter!("staging_jobs_timed_out_total").increment(1),
            _ => metrics::counter!("staging_jobs_failed_total").increment(1),
        }
        metrics::gauge!("staging_jobs_in_flight").decrement(1.0);
        self.stop_tracking(correlation_id);

        if let Some(record) = self.store.get(correlation_id).await {
            let elapsed = record.elapsed(Utc::now()).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("staging_job_duration_seconds", "status" => status.to_string())
                .record(elapsed);
            tracing::info!(
                correlation_id = %correlation_id,
                provider_job_id = ?record.handle.provider_job_id,
                status = %status,
                elapsed_secs = elapsed,
                error = ?record.error.as_ref().map(|e| e.kind),
                "Job resolved"
            );
        }

        let images = self.images.clone();
        tokio::spawn(async move {
            images.release(correlation_id).await;
        });
    }
}

/// Terminal outcome for a provider status, or `None` while still running.
///
/// A success whose output normalizes to zero URLs becomes a normalization
/// failure here, before it can reach the store.
pub(crate) fn terminal_outcome(
    status: &ProviderStatus,
    normalizer: &Normalizer,
) -> Option<JobOutcome> {
    match status {
        ProviderStatus::InProgress { .. } => None,
        ProviderStatus::Succeeded(payload) => Some(match normalizer.normalize(payload) {
            Ok(result) => JobOutcome::Completed(result),
            Err(e) => JobOutcome::failed(ErrorKind::Normalization, e.to_string()),
        }),
        ProviderStatus::Failed { message } => Some(JobOutcome::failed(
            ErrorKind::ProviderFailed,
            message
                .clone()
                .unwrap_or_else(|| "provider reported the job as failed".to_string()),
        )),
    }
}

/// What a terminal write means for the strategy that attempted it.
pub(crate) fn strategy_outcome(transition: &TransitionOutcome) -> StrategyOutcome {
    match *transition {
        TransitionOutcome::Applied {
            status: JobStatus::TimedOut,
            ..
        } => StrategyOutcome::TimedOut,
        TransitionOutcome::Applied { status, .. } => StrategyOutcome::Resolved(status),
        TransitionOutcome::AlreadyTerminal(status) => StrategyOutcome::Superseded(status),
        TransitionOutcome::Unchanged(_)
        | TransitionOutcome::NotFound
        | TransitionOutcome::Parked => StrategyOutcome::Untracked,
    }
}

/// Outcome for a run whose token fired: a terminal write elsewhere, or a
/// genuine cancellation.
pub(crate) async fn after_cancel(store: &Arc<dyn JobStore>, correlation_id: Uuid) -> StrategyOutcome {
    match store.get(correlation_id).await {
        Some(record) if record.status.is_terminal() => StrategyOutcome::Superseded(record.status),
        Some(_) => StrategyOutcome::Cancelled,
        None => StrategyOutcome::Untracked,
    }
}
