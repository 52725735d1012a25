//! Idempotent provisioning on top of the job waiter.
//!
//! One [`Provisioner`] drives every storage kind through the same skeleton
//! (validate, look up by name, create or reuse, finalise); the kind-specific
//! parts live behind [`ResourceApi`] and in the kind's [`ResourceProfile`].

use std::sync::Arc;

use thiserror::Error;

use crate::cloud::{CloudError, ResourceApi, ResourceKind};
use crate::job::{JobError, JobKind};
use crate::poll::Backoff;

mod attach;
mod create;
mod expand;

pub use attach::{Attacher, DeviceResolver};
pub use create::Provisioned;
pub use expand::ExpandOutcome;

/// One gibibyte, the provider's size unit.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Size limits and pacing for one kind of storage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceProfile {
    /// Kind the profile applies to.
    pub kind: ResourceKind,
    /// Smallest size the provider accepts, in GiB.
    pub min_gb: u64,
    /// Largest size the provider accepts, in GiB.
    pub max_gb: Option<u64>,
    /// Smallest increase accepted by an expand request, in GiB.
    pub expand_step_gb: u64,
    /// Pacing for create jobs.
    pub create_backoff: Backoff,
    /// Pacing for expand and delete jobs.
    pub expand_backoff: Backoff,
    /// Whether the content source is reported back and compared on reuse.
    pub tracks_source: bool,
    /// Whether a node must grow the filesystem after an expand.
    pub node_expansion: bool,
}

impl ResourceProfile {
    /// Block volumes.
    pub const BLOCK: Self = Self {
        kind: ResourceKind::Block,
        min_gb: 10,
        max_gb: Some(32_768),
        expand_step_gb: 1,
        create_backoff: Backoff::JOB,
        expand_backoff: Backoff::JOB,
        tracks_source: true,
        node_expansion: true,
    };

    /// NFS file shares.
    pub const SHARE: Self = Self {
        kind: ResourceKind::Share,
        min_gb: 1,
        max_gb: None,
        expand_step_gb: 1,
        create_backoff: Backoff::SHARE_JOB,
        expand_backoff: Backoff::JOB,
        tracks_source: true,
        node_expansion: false,
    };

    /// Scale-out file shares.
    pub const TURBO_SHARE: Self = Self {
        kind: ResourceKind::TurboShare,
        min_gb: 500,
        max_gb: Some(32_768),
        expand_step_gb: 100,
        create_backoff: Backoff::SHARE_JOB,
        expand_backoff: Backoff::SHARE_JOB,
        tracks_source: false,
        node_expansion: false,
    };

    /// Returns the built-in profile for `kind`.
    #[must_use]
    pub const fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Block => Self::BLOCK,
            ResourceKind::Share => Self::SHARE,
            ResourceKind::TurboShare => Self::TURBO_SHARE,
        }
    }

    /// Vocabulary of the resource's own status while it is being created.
    #[must_use]
    pub const fn creation_status(&self) -> JobKind {
        match self.kind {
            ResourceKind::Block => JobKind::VolumeCreate,
            ResourceKind::Share => JobKind::ShareCreate,
            ResourceKind::TurboShare => JobKind::TurboCreate,
        }
    }

    /// Replaces both backoff schedules.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.create_backoff = backoff;
        self.expand_backoff = backoff;
        self
    }

    /// Converts a requested capacity range in bytes into a provider size.
    ///
    /// The required size is rounded up to whole GiB and raised to the kind's
    /// minimum. A zero `required_bytes` selects the minimum; a zero
    /// `limit_bytes` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidArgument`] when the limit is below the
    /// requirement and [`ProvisionError::OutOfRange`] when the resulting size
    /// exceeds the limit or the kind's maximum.
    pub fn size_for(&self, required_bytes: u64, limit_bytes: u64) -> Result<u64, ProvisionError> {
        if limit_bytes > 0 && limit_bytes < required_bytes {
            return Err(ProvisionError::InvalidArgument(format!(
                "capacity limit {limit_bytes} is below required {required_bytes} bytes"
            )));
        }
        let size_gb = required_bytes.div_ceil(GIB).max(self.min_gb);
        if let Some(max_gb) = self.max_gb.filter(|max| size_gb > *max) {
            return Err(ProvisionError::OutOfRange(format!(
                "{} size {size_gb} GiB exceeds maximum {max_gb} GiB",
                self.kind
            )));
        }
        if limit_bytes > 0 && size_gb.saturating_mul(GIB) > limit_bytes {
            return Err(ProvisionError::OutOfRange(format!(
                "{} minimum size {size_gb} GiB exceeds capacity limit {limit_bytes} bytes",
                self.kind
            )));
        }
        Ok(size_gb)
    }

    fn check_bounds(&self, size_gb: u64) -> Result<(), ProvisionError> {
        if size_gb < self.min_gb {
            return Err(ProvisionError::OutOfRange(format!(
                "{} size {size_gb} GiB is below minimum {} GiB",
                self.kind, self.min_gb
            )));
        }
        match self.max_gb {
            Some(max_gb) if size_gb > max_gb => Err(ProvisionError::OutOfRange(format!(
                "{} size {size_gb} GiB exceeds maximum {max_gb} GiB",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}

/// Errors raised by provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A request field is missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A requested size lies outside the kind's limits.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The addressed resource does not exist.
    #[error("resource {id} not found")]
    NotFound {
        /// Identifier that was looked up.
        id: String,
    },
    /// A resource with the requested name exists with different attributes.
    #[error("resource {name} already exists with conflicting attributes: {reason}")]
    Conflict {
        /// Requested name.
        name: String,
        /// First attribute that differs.
        reason: String,
    },
    /// More than one resource carries the requested name.
    #[error("found {count} resources named {name}: {}", .ids.join(", "))]
    Ambiguous {
        /// Requested name.
        name: String,
        /// Number of matches.
        count: usize,
        /// Identifiers of every match.
        ids: Vec<String>,
    },
    /// Waiting for a provider job failed or timed out.
    #[error(transparent)]
    Job(#[from] JobError),
    /// A provider call failed.
    #[error("provider call failed: {0}")]
    Cloud(#[from] CloudError),
    /// A successful create job did not name the resource it created.
    #[error("job {job_id} succeeded without reporting a resource id")]
    MissingEntity {
        /// Provider job identifier.
        job_id: String,
    },
    /// The provider reported a different size after an expand.
    #[error("resource {id} is {actual_gb} GiB after expand, expected {expected_gb} GiB")]
    SizeMismatch {
        /// Resource identifier.
        id: String,
        /// Size requested from the provider.
        expected_gb: u64,
        /// Size reported after the job finished.
        actual_gb: u64,
    },
    /// No device path could be found for an attached volume.
    #[error("no device path for volume {volume_id} on instance {instance_id}")]
    DeviceNotFound {
        /// Volume identifier.
        volume_id: String,
        /// Instance identifier.
        instance_id: String,
    },
}

impl ProvisionError {
    fn from_lookup(id: &str, err: CloudError) -> Self {
        if err.is_not_found() {
            Self::NotFound { id: id.to_owned() }
        } else {
            Self::Cloud(err)
        }
    }
}

/// Generic provisioning state machine for one storage kind.
#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn ResourceApi>,
    profile: ResourceProfile,
    access_network: Option<String>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("profile", &self.profile)
            .field("access_network", &self.access_network)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Creates a provisioner using the built-in profile of the API's kind.
    #[must_use]
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        let profile = ResourceProfile::for_kind(api.kind());
        Self {
            api,
            profile,
            access_network: None,
        }
    }

    /// Overrides the profile, typically to shorten backoff in tests.
    #[must_use]
    pub const fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Network granted access to every provisioned resource.
    #[must_use]
    pub fn with_access_network(mut self, network_id: Option<String>) -> Self {
        self.access_network = network_id;
        self
    }

    /// Profile in use.
    #[must_use]
    pub const fn profile(&self) -> &ResourceProfile {
        &self.profile
    }

    /// Kind of storage managed by this provisioner.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.profile.kind
    }

    /// Fetches a resource by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] for a missing resource and
    /// [`ProvisionError::Cloud`] for other provider failures.
    pub async fn get(&self, id: &str) -> Result<crate::cloud::Resource, ProvisionError> {
        self.api
            .get(id)
            .await
            .map_err(|err| ProvisionError::from_lookup(id, err))
    }
}
