use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::models::staging::StagingResult;
use crate::services::provider::ProviderKind;

/// Status of a staging job.
///
/// Moves forward only: `Pending → Processing → {Completed | Failed | TimedOut}`.
/// `Pending` may jump straight to a terminal status when the provider resolves
/// before ever reporting progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed | Self::TimedOut => 2,
        }
    }

    /// Whether `self → next` respects the forward-only lifecycle.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// User-visible error classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Validation,
    Quota,
    Transient,
    Normalization,
    TimedOut,
    Upload,
    Cancelled,
    ProviderFailed,
}

impl ErrorKind {
    /// Whether a caller may reasonably resubmit the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::TimedOut | Self::Quota | Self::Upload)
    }
}

/// Error attached to a failed or timed-out job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Identifiers for one staging request.
///
/// `correlation_id` is generated locally and is the only key the rest of the
/// system uses. `provider_job_id` arrives with the provider's first response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobHandle {
    pub correlation_id: Uuid,
    pub provider_job_id: Option<String>,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(correlation_id: Uuid, provider: ProviderKind) -> Self {
        Self {
            correlation_id,
            provider_job_id: None,
            provider,
            created_at: Utc::now(),
        }
    }

    pub fn with_provider_job_id(mut self, provider_job_id: impl Into<String>) -> Self {
        self.provider_job_id = Some(provider_job_id.into());
        self
    }
}

/// Terminal result applied to a job record exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(StagingResult),
    Failed(ErrorInfo),
    TimedOut(ErrorInfo),
}

impl JobOutcome {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed(ErrorInfo::new(kind, message))
    }

    pub fn timed_out(waited: Duration) -> Self {
        Self::TimedOut(ErrorInfo::new(
            ErrorKind::TimedOut,
            format!(
                "no result from provider within {}s; the request may be resubmitted",
                waited.as_secs()
            ),
        ))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::TimedOut(_) => JobStatus::TimedOut,
        }
    }
}

/// A staging job as tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub handle: JobHandle,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub result: Option<StagingResult>,
    pub error: Option<ErrorInfo>,
}

impl JobRecord {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            submitted_at: handle.created_at,
            handle,
            status: JobStatus::Pending,
            resolved_at: None,
            result: None,
            error: None,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.handle.correlation_id
    }

    /// Move to `Processing`. Returns false if the lifecycle forbids it.
    pub fn mark_processing(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Processing) {
            return false;
        }
        self.status = JobStatus::Processing;
        true
    }

    /// Apply a terminal outcome. Returns the status actually written, or `None`
    /// if the record was already terminal.
    ///
    /// A completion carrying no images is recorded as a normalization failure.
    pub fn apply(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Option<JobStatus> {
        if self.status.is_terminal() {
            return None;
        }

        match outcome {
            JobOutcome::Completed(result) if result.images.is_empty() => {
                self.status = JobStatus::Failed;
                self.error = Some(ErrorInfo::new(
                    ErrorKind::Normalization,
                    "provider reported completion without any images",
                ));
            }
            JobOutcome::Completed(result) => {
                self.status = JobStatus::Completed;
                self.result = Some(result);
            }
            JobOutcome::Failed(error) => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
            }
            JobOutcome::TimedOut(error) => {
                self.status = JobStatus::TimedOut;
                self.error = Some(error);
            }
        }

        self.resolved_at = Some(now);
        Some(self.status)
    }

    /// Time since submission, or until resolution for terminal records.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.resolved_at.unwrap_or(now) - self.submitted_at
    }
}
