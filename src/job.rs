//! Waiting for asynchronous provider jobs.
//!
//! Most mutating provider calls return a job handle immediately. The job
//! waiter turns a status lookup into a [`poll_until`] condition and
//! classifies the provider's raw status strings into [`JobState`] using the
//! vocabulary of the operation that produced the job.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cloud::CloudError;
use crate::poll::{Backoff, Outcome, PollError, poll_until};

/// Closed set of job states the rest of the crate switches on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// The job is still queued or running.
    Pending,
    /// The job finished successfully.
    Success,
    /// The job reached a terminal failure.
    Failure,
}

/// Operation families, each with its own status vocabulary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    /// Jobs reported by the compute/block job service (create, delete and
    /// extend of block volumes, attach and detach).
    Compute,
    /// Block volume creation, observed through the volume status.
    VolumeCreate,
    /// File share creation, observed through the share status.
    ShareCreate,
    /// File share expansion, observed through the share status.
    ShareExtend,
    /// Scale-out share creation, observed through the numeric share status.
    TurboCreate,
    /// Scale-out share expansion, observed through the numeric sub-status.
    TurboExtend,
}

impl JobKind {
    /// Human readable label used in logs and errors.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Compute => "compute job",
            Self::VolumeCreate => "volume creation",
            Self::ShareCreate => "share creation",
            Self::ShareExtend => "share expansion",
            Self::TurboCreate => "scale-out share creation",
            Self::TurboExtend => "scale-out share expansion",
        }
    }

    /// Maps a raw provider status onto [`JobState`].
    ///
    /// Returns `None` when the string is not part of this kind's vocabulary.
    #[must_use]
    pub fn classify(self, raw: &str) -> Option<JobState> {
        let status = raw.trim();
        let matches_any = |words: &[&str]| words.iter().any(|w| status.eq_ignore_ascii_case(w));
        let (pending, success, failure): (&[&str], &[&str], &[&str]) = match self {
            Self::Compute => (
                &["INIT", "PENDING", "RUNNING"],
                &["SUCCESS"],
                &["FAIL", "ERROR"],
            ),
            Self::VolumeCreate => (
                &["creating", "downloading"],
                &["available", "in-use"],
                &["error"],
            ),
            Self::ShareCreate => (&["creating"], &["available"], &["error"]),
            Self::ShareExtend => (
                &["extending"],
                &["available"],
                &["extending_error", "error"],
            ),
            Self::TurboCreate => (&["100"], &["200"], &["303"]),
            Self::TurboExtend => (&["121"], &["221"], &["321", "322"]),
        };

        if matches_any(pending) {
            Some(JobState::Pending)
        } else if matches_any(success) {
            Some(JobState::Success)
        } else if matches_any(failure) {
            Some(JobState::Failure)
        } else {
            None
        }
    }
}

/// Handle to an in-flight provider operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobHandle {
    /// Provider job identifier. For share jobs this is the share id.
    pub id: String,
    /// Vocabulary used to interpret the job's status.
    pub kind: JobKind,
}

impl JobHandle {
    /// Creates a handle for the given job id and kind.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// A single observation of a job's status.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobSnapshot {
    /// Raw provider status string.
    pub status: String,
    /// Resource reference embedded in the job, such as the new volume id.
    pub entity: Option<String>,
    /// Failure reason reported by the provider, if any.
    pub reason: Option<String>,
}

/// Result of a job that finished successfully.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobOutcome {
    /// Identifier of the completed job.
    pub job_id: String,
    /// Resource reference captured from the final snapshot.
    pub entity: Option<String>,
}

/// Errors raised while waiting for a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The provider reported a terminal failure for the job.
    #[error("{label} {job_id} failed with status {status}{}", format_reason(.reason.as_deref()))]
    Failed {
        /// What the job was doing.
        label: &'static str,
        /// Provider job identifier.
        job_id: String,
        /// Last status observed.
        status: String,
        /// Failure reason returned by the provider.
        reason: Option<String>,
    },
    /// The poll budget ran out; the job's outcome is unknown.
    #[error("timed out waiting for {label} {job_id} after {attempts} attempts")]
    TimedOut {
        /// What the job was doing.
        label: &'static str,
        /// Provider job identifier.
        job_id: String,
        /// Number of status lookups performed.
        attempts: u32,
    },
    /// Looking up the job status failed.
    #[error("failed to query {label} {job_id}: {source}")]
    Lookup {
        /// What the job was doing.
        label: &'static str,
        /// Provider job identifier.
        job_id: String,
        /// Underlying provider error.
        #[source]
        source: CloudError,
    },
}

fn format_reason(reason: Option<&str>) -> String {
    reason.map_or_else(String::new, |text| format!(": {text}"))
}

/// Polls `lookup` under `backoff` until the job identified by `job`
/// reaches a terminal state.
///
/// # Errors
///
/// Returns [`JobError::Lookup`] as soon as a lookup fails,
/// [`JobError::Failed`] when the provider reports a failure status, and
/// [`JobError::TimedOut`] when the job is still pending after the last
/// attempt.
pub async fn wait_for_job<F, Fut>(
    job: &JobHandle,
    backoff: Backoff,
    mut lookup: F,
) -> Result<JobOutcome, JobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobSnapshot, CloudError>>,
{
    let job_id = job.id.as_str();
    let kind = job.kind;
    let label = kind.label();

    let result = poll_until(backoff, move || {
        let pending = lookup();
        async move {
            let snapshot = match pending.await {
                Ok(snapshot) => snapshot,
                Err(source) => {
                    return Outcome::Failure(JobError::Lookup {
                        label,
                        job_id: job_id.to_owned(),
                        source,
                    });
                }
            };

            match kind.classify(&snapshot.status) {
                Some(JobState::Success) => Outcome::Success(snapshot.entity),
                Some(JobState::Failure) => Outcome::Failure(JobError::Failed {
                    label,
                    job_id: job_id.to_owned(),
                    status: snapshot.status,
                    reason: snapshot.reason,
                }),
                Some(JobState::Pending) => {
                    debug!(job_id, status = %snapshot.status, "{label} pending");
                    Outcome::Pending
                }
                None => {
                    warn!(job_id, status = %snapshot.status, "unrecognised {label} status");
                    Outcome::Pending
                }
            }
        }
    })
    .await;

    match result {
        Ok(entity) => Ok(JobOutcome {
            job_id: job_id.to_owned(),
            entity,
        }),
        Err(PollError::Condition(err)) => Err(err),
        Err(PollError::TimedOut { attempts }) => Err(JobError::TimedOut {
            label,
            job_id: job_id.to_owned(),
            attempts,
        }),
    }
}
