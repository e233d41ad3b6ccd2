use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    after_cancel, strategy_outcome, terminal_outcome, CompletionStrategy, Finisher,
    StrategyOutcome,
};
use crate::config::PollingConfig;
use crate::models::job::{ErrorKind, JobHandle, JobOutcome};
use crate::services::job_store::TransitionOutcome;
use crate::services::provider::{CompletionMode, StagingProvider};

/// Repeatedly asks the provider for the job status until it resolves or the
/// deadline passes.
///
/// `NotStarted → Polling → {Resolved | TimedOut}`. Both suspension points (the
/// inter-poll sleep and the status call) race the cancellation token, and the
/// status call carries its own timeout, so a job ends no later than
/// `max_wait + interval` after polling starts.
pub struct PollingStrategy {
    provider: Arc<dyn StagingProvider>,
    finisher: Finisher,
    config: PollingConfig,
}

impl PollingStrategy {
    pub fn new(provider: Arc<dyn StagingProvider>, finisher: Finisher, config: PollingConfig) -> Self {
        Self {
            provider,
            finisher,
            config,
        }
    }

    async fn time_out(&self, handle: &JobHandle) -> StrategyOutcome {
        let transition = self
            .finisher
            .finish(handle.correlation_id, JobOutcome::timed_out(self.config.max_wait))
            .await;
        strategy_outcome(&transition)
    }
}

#[async_trait]
impl CompletionStrategy for PollingStrategy {
    fn mode(&self) -> CompletionMode {
        CompletionMode::Polling
    }

    async fn run(&self, handle: JobHandle, cancel: CancellationToken) -> StrategyOutcome {
        let correlation_id = handle.correlation_id;
        let store = self.finisher.store();

        let Some(provider_job_id) = handle.provider_job_id.clone() else {
            let transition = self
                .finisher
                .finish(
                    correlation_id,
                    JobOutcome::failed(
                        ErrorKind::ProviderFailed,
                        "provider accepted the job without returning a job id",
                    ),
                )
                .await;
            return strategy_outcome(&transition);
        };

        let deadline = Instant::now() + self.config.max_wait;
        let mut attempt: u32 = 0;

        loop {
            // Never sleep past the deadline; the last poll happens at it.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let interval = self.config.interval_for(attempt);
            let pause = interval.min(remaining);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return after_cancel(store, correlation_id).await,
                _ = tokio::time::sleep(pause) => {}
            }

            let budget = (deadline + interval).saturating_duration_since(Instant::now());
            let call_timeout = self
                .config
                .request_timeout
                .min(budget)
                .max(Duration::from_millis(1));

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return after_cancel(store, correlation_id).await,
                polled = tokio::time::timeout(call_timeout, self.provider.poll_status(&provider_job_id)) => polled,
            };
            attempt += 1;

            match polled {
                Err(_) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        provider_job_id = %provider_job_id,
                        attempt,
                        "Status poll timed out"
                    );
                }
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        attempt,
                        error = %e,
                        "Transient error while polling, continuing"
                    );
                }
                Ok(Err(e)) => {
                    let transition = self
                        .finisher
                        .finish(correlation_id, JobOutcome::Failed(e.to_error_info()))
                        .await;
                    return strategy_outcome(&transition);
                }
                Ok(Ok(status)) => {
                    if let Some(outcome) = terminal_outcome(&status, self.provider.normalizer()) {
                        let transition = self.finisher.finish(correlation_id, outcome).await;
                        return strategy_outcome(&transition);
                    }

                    tracing::debug!(
                        correlation_id = %correlation_id,
                        attempt,
                        status = ?status,
                        "Job still running"
                    );
                    match store.mark_processing(correlation_id).await {
                        TransitionOutcome::AlreadyTerminal(status) => {
                            return StrategyOutcome::Superseded(status)
                        }
                        TransitionOutcome::NotFound => return StrategyOutcome::Untracked,
                        _ => {}
                    }
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    provider_job_id = %provider_job_id,
                    attempts = attempt,
                    "Job did not resolve before its deadline"
                );
                return self.time_out(&handle).await;
            }
        }
    }
}
