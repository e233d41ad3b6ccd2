//! Cleanup Sweeper.
//!
//! One recurring task owned by the process: times out jobs nobody resolved,
//! reaps records past retention, deletes expired hosted images, and drops
//! parked webhooks that never found their job. It walks a snapshot of keys
//! and touches records one at a time, so webhook writers are never blocked
//! for a whole scan.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SweeperConfig;
use crate::models::job::JobOutcome;
use crate::services::completion::Finisher;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub reaped: usize,
    pub images_released: usize,
    pub parked_expired: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct CleanupSweeper {
    finisher: Finisher,
    config: SweeperConfig,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

impl CleanupSweeper {
    pub fn new(finisher: Finisher, config: SweeperConfig) -> Self {
        Self { finisher, config }
    }

    /// Run [`sweep_once`](Self::sweep_once) every interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                "Cleanup sweeper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Cleanup sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once(Utc::now()).await;
                    }
                }
            }
        })
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let store = self.finisher.store();
        let images = self.finisher.images();
        let max_wait = chrono_duration(self.config.max_wait);
        let retention = chrono_duration(self.config.job_retention);
        let mut report = SweepReport::default();

        for correlation_id in store.keys().await {
            let Some(record) = store.get(correlation_id).await else {
                continue;
            };

            if !record.status.is_terminal() {
                // Safety net for jobs whose strategy never resolved them.
                if now - record.submitted_at > max_wait {
                    let transition = self
                        .finisher
                        .finish(correlation_id, JobOutcome::timed_out(self.config.max_wait))
                        .await;
                    if transition.is_applied() {
                        report.timed_out += 1;
                    }
                }
                continue;
            }

            let anchor = record.resolved_at.unwrap_or(record.submitted_at);
            if now - anchor > retention && store.remove(correlation_id).await.is_some() {
                report.reaped += 1;
            }
        }

        let image_cutoff = now - chrono_duration(self.config.image_retention);
        for correlation_id in images.uploaded_before(image_cutoff) {
            if images.release(correlation_id).await {
                report.images_released += 1;
            }
        }

        report.parked_expired = store.expire_parked(now - retention).await;

        metrics::counter!("staging_sweeper_reaped_total").increment(report.reaped as u64);
        if report.is_empty() {
            tracing::debug!("Sweep found nothing to clean up");
        } else {
            let remaining = store.len().await;
            tracing::info!(
                timed_out = report.timed_out,
                reaped = report.reaped,
                images_released = report.images_released,
                parked_expired = report.parked_expired,
                remaining,
                "Sweep completed"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use uuid::Uuid;

    use crate::models::job::{ErrorKind, JobHandle, JobRecord, JobStatus};
    use crate::models::staging::StagingResult;
    use crate::services::image_host::{HostedImage, ImageHost, TempImageRegistry};
    use crate::services::job_store::{InMemoryJobStore, JobStore};
    use crate::services::provider::ProviderKind;
    use crate::services::testing::RecordingHost;

    fn config() -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(300),
            job_retention: Duration::from_secs(3600),
            image_retention: Duration::from_secs(600),
            max_wait: Duration::from_secs(180),
        }
    }

    fn setup() -> (Arc<InMemoryJobStore>, Arc<RecordingHost>, CleanupSweeper) {
        let store = Arc::new(InMemoryJobStore::new());
        let host = Arc::new(RecordingHost::default());
        let host_dyn: Arc<dyn ImageHost> = host.clone();
        let images = Arc::new(TempImageRegistry::new(Some(host_dyn)));
        let sweeper = CleanupSweeper::new(Finisher::new(store.clone(), images), config());
        (store, host, sweeper)
    }

    async fn insert_aged(store: &InMemoryJobStore, age: chrono::Duration) -> Uuid {
        let mut handle = JobHandle::new(Uuid::new_v4(), ProviderKind::InstantDeco);
        handle.created_at = Utc::now() - age;
        let id = handle.correlation_id;
        store.insert(JobRecord::new(handle)).await.unwrap();
        id
    }

    fn completed() -> JobOutcome {
        JobOutcome::Completed(StagingResult {
            images: vec!["https://cdn/a.png".into()],
            provider_metadata: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn test_stale_pending_job_times_out() {
        let (store, _host, sweeper) = setup();
        let stale = insert_aged(&store, chrono::Duration::minutes(10)).await;
        let fresh = insert_aged(&store, chrono::Duration::seconds(30)).await;

        let report = sweeper.sweep_once(Utc::now()).await;

        assert_eq!(report.timed_out, 1);
        let record = store.get(stale).await.unwrap();
        assert_eq!(record.status, JobStatus::TimedOut);
        assert_eq!(record.error.unwrap().kind, ErrorKind::TimedOut);
        assert_eq!(store.get(fresh).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_resolved_jobs_reaped_after_retention() {
        let (store, _host, sweeper) = setup();
        let id = insert_aged(&store, chrono::Duration::seconds(5)).await;
        store.finish(id, completed()).await;

        let now = Utc::now();
        assert!(sweeper.sweep_once(now).await.is_empty());
        assert!(store.get(id).await.is_some());

        let report = sweeper.sweep_once(now + chrono::Duration::hours(2)).await;
        assert_eq!(report.reaped, 1);
        assert!(store.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_images_released() {
        let (_store, host, sweeper) = setup();
        let images = sweeper.finisher.images();
        let old = Uuid::new_v4();
        images.register(
            old,
            HostedImage {
                url: "https://img.example.com/old.png".into(),
                delete_handle: None,
                uploaded_at: Utc::now() - chrono::Duration::minutes(15),
            },
        );
        images.register(
            Uuid::new_v4(),
            HostedImage {
                url: "https://img.example.com/new.png".into(),
                delete_handle: None,
                uploaded_at: Utc::now(),
            },
        );

        let report = sweeper.sweep_once(Utc::now()).await;
        assert_eq!(report.images_released, 1);
        assert_eq!(host.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn test_parked_webhooks_expire() {
        let (store, _host, sweeper) = setup();
        store.finish_by_provider_id("orphan", completed(), None).await;

        assert_eq!(sweeper.sweep_once(Utc::now()).await.parked_expired, 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(sweeper.sweep_once(later).await.parked_expired, 1);
    }

    #[test]
    fn test_sweep_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_store, _host, sweeper) = setup();
        assert_send(&sweeper.sweep_once(Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let (store, _host, sweeper) = setup();
        let stale = insert_aged(&store, chrono::Duration::minutes(10)).await;
        let shutdown = CancellationToken::new();
        let task = Arc::new(sweeper).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(store.get(stale).await.unwrap().status, JobStatus::TimedOut);

        shutdown.cancel();
        task.await.unwrap();
    }
}
