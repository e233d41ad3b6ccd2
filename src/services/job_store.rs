//! Job Store: correlation id → [`JobRecord`].
//!
//! Writers (the completion strategies, the webhook receiver, the sweeper)
//! go through compare-and-set style operations; readers get cloned snapshots.
//! The in-memory implementation shards its maps with `DashMap`, so no lock
//! spans the whole store and no guard is ever held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::job::{JobOutcome, JobRecord, JobStatus};

/// Result of a state-changing store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The write was applied and produced `status`.
    Applied { correlation_id: Uuid, status: JobStatus },
    /// Nothing to do; the record is already at or past the requested status.
    Unchanged(JobStatus),
    /// The record had already reached a terminal status; the write was dropped.
    AlreadyTerminal(JobStatus),
    NotFound,
    /// Provider id not attached to any record yet; the outcome was kept aside.
    Parked,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("job {0} not found")]
    NotFound(Uuid),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, correlation_id: Uuid) -> Option<JobRecord>;

    async fn find_by_provider_id(&self, provider_job_id: &str) -> Option<Uuid>;

    /// Link a provider job id to a record.
    ///
    /// If a webhook for that provider id was parked before the link existed,
    /// its outcome is applied here and the transition is returned.
    async fn attach_provider_id(
        &self,
        correlation_id: Uuid,
        provider_job_id: &str,
    ) -> Result<Option<TransitionOutcome>, StoreError>;

    async fn mark_processing(&self, correlation_id: Uuid) -> TransitionOutcome;

    /// Apply a terminal outcome. At most one terminal write per record wins.
    async fn finish(&self, correlation_id: Uuid, outcome: JobOutcome) -> TransitionOutcome;

    /// Apply a terminal outcome addressed by provider job id.
    ///
    /// Falls back to `fallback` (a correlation id echoed by the provider) when
    /// the provider id is not linked yet, and parks the outcome when neither
    /// resolves to a record.
    async fn finish_by_provider_id(
        &self,
        provider_job_id: &str,
        outcome: JobOutcome,
        fallback: Option<Uuid>,
    ) -> TransitionOutcome;

    /// Snapshot of every tracked correlation id.
    async fn keys(&self) -> Vec<Uuid>;

    async fn remove(&self, correlation_id: Uuid) -> Option<JobRecord>;

    /// Drop parked outcomes received before `cutoff`. Returns how many.
    async fn expire_parked(&self, cutoff: DateTime<Utc>) -> usize;

    async fn len(&self) -> usize;
}

#[derive(Debug, Clone)]
struct ParkedOutcome {
    outcome: JobOutcome,
    received_at: DateTime<Utc>,
}

/// Process-local store. Restart loses every in-flight job.
///
/// Lock order is `provider_index` before `records` or `parked`; no method
/// holds two entries of the same map at once.
#[derive(Default)]
pub struct InMemoryJobStore {
    records: DashMap<Uuid, JobRecord>,
    provider_index: DashMap<String, Uuid>,
    parked: DashMap<String, ParkedOutcome>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_record(&self, correlation_id: Uuid, outcome: JobOutcome) -> TransitionOutcome {
        let Some(mut record) = self.records.get_mut(&correlation_id) else {
            return TransitionOutcome::NotFound;
        };

        match record.apply(outcome, Utc::now()) {
            Some(status) => TransitionOutcome::Applied {
                correlation_id,
                status,
            },
            None => TransitionOutcome::AlreadyTerminal(record.status),
        }
    }

    /// Whether `correlation_id` may be resolved by a webhook for `provider_job_id`.
    fn fallback_matches(&self, correlation_id: Uuid, provider_job_id: &str) -> bool {
        self.records
            .get(&correlation_id)
            .map(|record| match &record.handle.provider_job_id {
                Some(existing) => existing == provider_job_id,
                None => true,
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let correlation_id = record.correlation_id();
        match self.records.entry(correlation_id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, correlation_id: Uuid) -> Option<JobRecord> {
        self.records.get(&correlation_id).map(|r| r.value().clone())
    }

    async fn find_by_provider_id(&self, provider_job_id: &str) -> Option<Uuid> {
        self.provider_index.get(provider_job_id).map(|id| *id)
    }

    async fn attach_provider_id(
        &self,
        correlation_id: Uuid,
        provider_job_id: &str,
    ) -> Result<Option<TransitionOutcome>, StoreError> {
        match self.records.get_mut(&correlation_id) {
            Some(mut record) => {
                record.handle.provider_job_id = Some(provider_job_id.to_string());
            }
            None => return Err(StoreError::NotFound(correlation_id)),
        }

        // A webhook parks only while holding the vacant index entry, so after
        // this insert either it saw the link or its outcome is already parked.
        self.provider_index
            .insert(provider_job_id.to_string(), correlation_id);

        let parked = self.parked.remove(provider_job_id).map(|(_, p)| p);
        Ok(parked.map(|p| {
            tracing::info!(
                correlation_id = %correlation_id,
                provider_job_id = %provider_job_id,
                "Applying webhook that arrived before submission completed"
            );
            self.finish_record(correlation_id, p.outcome)
        }))
    }

    async fn mark_processing(&self, correlation_id: Uuid) -> TransitionOutcome {
        let Some(mut record) = self.records.get_mut(&correlation_id) else {
            return TransitionOutcome::NotFound;
        };

        if record.status.is_terminal() {
            TransitionOutcome::AlreadyTerminal(record.status)
        } else if record.mark_processing() {
            TransitionOutcome::Applied {
                correlation_id,
                status: JobStatus::Processing,
            }
        } else {
            TransitionOutcome::Unchanged(record.status)
        }
    }

    async fn finish(&self, correlation_id: Uuid, outcome: JobOutcome) -> TransitionOutcome {
        self.finish_record(correlation_id, outcome)
    }

    async fn finish_by_provider_id(
        &self,
        provider_job_id: &str,
        outcome: JobOutcome,
        fallback: Option<Uuid>,
    ) -> TransitionOutcome {
        let linked = match self.provider_index.entry(provider_job_id.to_string()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                if let Some(correlation_id) = fallback {
                    if self.fallback_matches(correlation_id, provider_job_id) {
                        return self.finish_record(correlation_id, outcome);
                    }
                }

                self.parked.insert(
                    entry.key().clone(),
                    ParkedOutcome {
                        outcome,
                        received_at: Utc::now(),
                    },
                );
                return TransitionOutcome::Parked;
            }
        };

        self.finish_record(linked, outcome)
    }

    async fn keys(&self) -> Vec<Uuid> {
        self.records.iter().map(|entry| *entry.key()).collect()
    }

    async fn remove(&self, correlation_id: Uuid) -> Option<JobRecord> {
        let (_, record) = self.records.remove(&correlation_id)?;
        if let Some(provider_job_id) = &record.handle.provider_job_id {
            self.provider_index
                .remove_if(provider_job_id, |_, linked| *linked == correlation_id);
        }
        Some(record)
    }

    async fn expire_parked(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.parked.len();
        self.parked.retain(|_, parked| parked.received_at >= cutoff);
        before.saturating_sub(self.parked.len())
    }

    async fn len(&self) -> usize {
        self.records.len()
    }
}
