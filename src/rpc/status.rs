//! Protocol error codes and the mapping from domain errors onto them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::CloudError;
use crate::job::JobError;
use crate::mount::{FailureKind, MountError};
use crate::mounter::MounterError;
use crate::provision::ProvisionError;

/// Fixed error taxonomy of the storage-plugin protocol.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    /// A request field is missing or malformed.
    InvalidArgument,
    /// The addressed volume does not exist.
    NotFound,
    /// A volume with the same name exists with different attributes, or the
    /// name is ambiguous.
    AlreadyExists,
    /// The volume is not in a state the operation accepts.
    FailedPrecondition,
    /// The provider or a local tool failed.
    Internal,
    /// The outcome is not known; the operation may still complete.
    Unknown,
    /// The caller could not be authenticated.
    Unauthenticated,
    /// The operation is not supported.
    Unimplemented,
    /// A requested size is outside the supported range.
    OutOfRange,
    /// A local dependency could not be reached.
    Unavailable,
}

impl RpcCode {
    /// Stable string form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::FailedPrecondition => "failed_precondition",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
            Self::Unauthenticated => "unauthenticated",
            Self::Unimplemented => "unimplemented",
            Self::OutOfRange => "out_of_range",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(code, message)` error returned to RPC callers.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    /// Protocol error code.
    pub code: RpcCode,
    /// Human readable detail.
    pub message: String,
}

impl RpcStatus {
    /// Builds a status from a code and message.
    #[must_use]
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcCode::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    /// Shorthand for [`RpcCode::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    /// Shorthand for [`RpcCode::Unimplemented`].
    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unimplemented, message)
    }

    /// Shorthand for [`RpcCode::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }
}

impl From<CloudError> for RpcStatus {
    fn from(err: CloudError) -> Self {
        let code = if err.is_not_found() {
            RpcCode::NotFound
        } else if err.is_conflict() {
            RpcCode::AlreadyExists
        } else {
            RpcCode::Internal
        };
        Self::new(code, err.to_string())
    }
}

const fn job_code(err: &JobError) -> RpcCode {
    match err {
        JobError::Failed { .. } | JobError::Lookup { .. } => RpcCode::Internal,
        JobError::TimedOut { .. } => RpcCode::Unknown,
    }
}

impl From<JobError> for RpcStatus {
    fn from(err: JobError) -> Self {
        Self::new(job_code(&err), err.to_string())
    }
}

impl From<ProvisionError> for RpcStatus {
    fn from(err: ProvisionError) -> Self {
        let code = match &err {
            ProvisionError::InvalidArgument(_) => RpcCode::InvalidArgument,
            ProvisionError::OutOfRange(_) => RpcCode::OutOfRange,
            ProvisionError::NotFound { .. } | ProvisionError::DeviceNotFound { .. } => {
                RpcCode::NotFound
            }
            ProvisionError::Conflict { .. } | ProvisionError::Ambiguous { .. } => {
                RpcCode::AlreadyExists
            }
            ProvisionError::Job(job) => job_code(job),
            ProvisionError::Cloud(cloud) => return Self::from(cloud.clone()),
            ProvisionError::MissingEntity { .. } | ProvisionError::SizeMismatch { .. } => {
                RpcCode::Internal
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<MountError> for RpcStatus {
    fn from(err: MountError) -> Self {
        let code = if matches!(err, MountError::Transport(_)) {
            RpcCode::Unavailable
        } else {
            match err.failure_kind() {
                FailureKind::Unauthenticated => RpcCode::Unauthenticated,
                FailureKind::InvalidRequest => RpcCode::InvalidArgument,
                FailureKind::Precondition => RpcCode::FailedPrecondition,
                FailureKind::Execution => RpcCode::Internal,
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<MounterError> for RpcStatus {
    fn from(err: MounterError) -> Self {
        let code = match &err {
            MounterError::UnsupportedFilesystem { .. } => RpcCode::FailedPrecondition,
            MounterError::Stats { source, .. } if *source == nix::errno::Errno::ENOENT => {
                RpcCode::NotFound
            }
            MounterError::CommandFailed { .. }
            | MounterError::Spawn(_)
            | MounterError::Io { .. }
            | MounterError::Stats { .. } => RpcCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn failed_job() -> JobError {
        JobError::Failed {
            label: "volume create job",
            job_id: String::from("job-9"),
            status: String::from("FAIL"),
            reason: Some(String::from("quota exceeded")),
        }
    }

    #[rstest]
    #[case::invalid(ProvisionError::InvalidArgument(String::from("name")), RpcCode::InvalidArgument)]
    #[case::range(ProvisionError::OutOfRange(String::from("too big")), RpcCode::OutOfRange)]
    #[case::missing(ProvisionError::NotFound { id: String::from("v") }, RpcCode::NotFound)]
    #[case::conflict(
        ProvisionError::Conflict { name: String::from("pv"), reason: String::from("size") },
        RpcCode::AlreadyExists
    )]
    #[case::ambiguous(
        ProvisionError::Ambiguous { name: String::from("pv"), count: 2, ids: vec![] },
        RpcCode::AlreadyExists
    )]
    #[case::job_failed(ProvisionError::Job(failed_job()), RpcCode::Internal)]
    #[case::timed_out(
        ProvisionError::Job(JobError::TimedOut {
            label: "share create job",
            job_id: String::from("job-1"),
            attempts: 30,
        }),
        RpcCode::Unknown
    )]
    fn provision_errors_map_to_codes(#[case] err: ProvisionError, #[case] expected: RpcCode) {
        assert_eq!(RpcStatus::from(err).code, expected);
    }

    #[test]
    fn job_failure_message_keeps_job_id_and_status() {
        let status = RpcStatus::from(ProvisionError::Job(failed_job()));
        assert!(status.message.contains("job-9"));
        assert!(status.message.contains("FAIL"));
    }

    #[test]
    fn cloud_not_found_maps_to_not_found() {
        let status = RpcStatus::from(ProvisionError::Cloud(CloudError::NotFound {
            resource: String::from("volume"),
            id: String::from("v-1"),
        }));
        assert_eq!(status.code, RpcCode::NotFound);
    }

    #[rstest]
    #[case(MountError::Unauthenticated, RpcCode::Unauthenticated)]
    #[case(
        MountError::CredentialOutsideDir { path: String::from("/etc/passwd") },
        RpcCode::InvalidArgument
    )]
    #[case(
        MountError::Rejected {
            kind: Some(FailureKind::Unauthenticated),
            message: String::from("mount command failed authentication"),
        },
        RpcCode::Unauthenticated
    )]
    #[case(
        MountError::Rejected { kind: None, message: String::from("boom") },
        RpcCode::Internal
    )]
    #[case(
        MountError::CommandFailed {
            program: String::from("s3fs"),
            status_text: String::from("1"),
            output: String::from("denied"),
        },
        RpcCode::Internal
    )]
    fn mount_errors_map_to_codes(#[case] err: MountError, #[case] expected: RpcCode) {
        assert_eq!(RpcStatus::from(err).code, expected);
    }

    #[test]
    fn status_serialises_code_in_snake_case() {
        let json = serde_json::to_value(RpcStatus::not_found("gone")).expect("serialise");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "gone");
    }
}
